pub mod app;
pub mod config;
pub mod http1;
pub mod proxy;
pub mod shaping;
pub mod transport;
pub mod watchdog;

use std::sync::Arc;

pub use crate::config::Config;
use crate::shaping::registry::LimiterRegistry;

/// Everything a session needs from the process around it. Built once at
/// startup and shared by reference; nothing in here mutates after that except
/// the limiter registry's internal map.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub limiters: Arc<LimiterRegistry>,
}
