use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use wiregate_core::prelude::*;

use crate::ProxyInputs;
use crate::proxy::session::Session;
use crate::transport::stream::Socket;

/// The accept loop. Each connection becomes one session task; on shutdown the
/// loop stops accepting and waits for the sessions still in flight.
pub struct Gateway {
	pi: Arc<ProxyInputs>,
	shutdown: CancellationToken,
}

impl Gateway {
	pub fn new(pi: Arc<ProxyInputs>, shutdown: CancellationToken) -> Self {
		Gateway { pi, shutdown }
	}

	pub async fn run(self, listener: TcpListener) {
		let sessions = TaskTracker::new();
		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => break,
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(conn) => conn,
						Err(e) => {
							// Transient accept failures (fd pressure, reset
							// in backlog) should not take the listener down.
							warn!("accept failed: {e}");
							continue;
						},
					};
					debug!(peer = %peer, "connection accepted");
					match Socket::from_tcp(stream) {
						Ok(socket) => {
							let session = Session::new(self.pi.clone());
							sessions.spawn(session.run(socket));
						},
						Err(e) => warn!(peer = %peer, "failed to prepare socket: {e}"),
					}
				}
			}
		}
		sessions.close();
		info!(active = sessions.len(), "listener stopped, draining sessions");
		sessions.wait().await;
		info!("all sessions drained");
	}
}
