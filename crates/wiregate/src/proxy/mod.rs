pub mod classify;
pub mod forwarder;
pub mod gateway;
pub mod relay;
pub mod session;
pub mod tunnel;

pub use gateway::Gateway;

use crate::http1::MessageError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request: {0}")]
	InvalidRequest(#[source] MessageError),
	#[error("request too large")]
	RequestTooLarge,
	#[error("response too large")]
	ResponseTooLarge,
	#[error("blacklisted host")]
	Blacklisted,
	#[error("upstream connect failed: {0}")]
	Connect(std::io::Error),
	#[error("idle timeout")]
	IdleTimeout,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl ProxyError {
	/// The 400 body owed to the client, if any. Mid-stream failures return
	/// None: by the time they happen the proxy may already have relayed bytes
	/// that no response could legally follow.
	pub fn response_body(&self) -> Option<String> {
		match self {
			ProxyError::InvalidRequest(_) => Some("BAD REQUEST".to_string()),
			ProxyError::Blacklisted => Some("BLACKLISTED HOST".to_string()),
			ProxyError::RequestTooLarge => Some("Error: HTTP request too large!".to_string()),
			ProxyError::Connect(e) => Some(e.to_string()),
			_ => None,
		}
	}
}
