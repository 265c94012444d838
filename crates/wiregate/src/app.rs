use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiregate_core::prelude::*;
use wiregate_core::signal;

use crate::proxy::Gateway;
use crate::shaping::registry::LimiterRegistry;
use crate::{Config, ProxyInputs};

/// Binds the listener and starts the accept loop. Returns a handle the caller
/// parks on until termination.
pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let limiters = Arc::new(LimiterRegistry::new(cfg.bandwidth_per_sec));
	let pi = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		limiters,
	});

	let listener = TcpListener::bind(&cfg.bind_addr)
		.await
		.with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
	let address = listener.local_addr()?;
	info!(
		addr = %address,
		max_connections = cfg.max_connections,
		timeout_ms = cfg.idle_timeout.as_millis() as u64,
		bandwidth_per_sec = cfg.bandwidth_per_sec.get(),
		"proxy listening"
	);

	let stop = CancellationToken::new();
	let gateway = Gateway::new(pi, stop.clone());
	let task = tokio::spawn(gateway.run(listener));

	Ok(Bound {
		shutdown,
		stop,
		task,
		address,
	})
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	/// The actual listening address; differs from the configured one when
	/// binding port 0.
	pub address: SocketAddr,
	stop: CancellationToken,
	task: JoinHandle<()>,
}

impl Bound {
	/// Parks until a shutdown is requested (signal or trigger), then stops
	/// accepting and waits for in-flight sessions to drain.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self.stop.cancel();
		self.task.await.context("gateway task failed")?;
		Ok(())
	}
}
