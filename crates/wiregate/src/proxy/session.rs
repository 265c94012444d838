use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{Level, debug, event};

use crate::ProxyInputs;
use crate::http1;
use crate::proxy::ProxyError;
use crate::proxy::classify::{RequestClass, classify};
use crate::proxy::{forwarder, tunnel};
use crate::transport::stream::Socket;
use crate::watchdog::Watchdog;

/// One accepted connection, start to finish: read the first request, decide
/// what it is, hand it to the matching handler, and make sure whatever
/// happens stays inside this session.
pub struct Session {
	pi: Arc<ProxyInputs>,
}

/// What ends up in the access log. Filled in as the session learns more
/// about itself; errors are attached at the end.
#[derive(Default)]
struct AccessRecord {
	connect: bool,
	host: String,
	port: String,
}

impl Session {
	pub fn new(pi: Arc<ProxyInputs>) -> Self {
		Session { pi }
	}

	pub async fn run(self, client: Socket) {
		let peer = client.peer_addr();
		let counter = client.counter();
		let started = Instant::now();
		let mut record = AccessRecord::default();

		let error = self.handle(client, &mut record).await.err();
		if let Some(e) = &error {
			debug!(peer = %peer, "session ended with error: {e}");
		}

		let (sent, recv) = counter.load();
		event!(
			target: "access",
			Level::INFO,
			peer = %peer,
			connect = record.connect,
			host = %record.host,
			port = %record.port,
			sent,
			recv,
			duration_ms = started.elapsed().as_millis() as u64,
			error = error.map(|e| e.to_string()).unwrap_or_default(),
			"closed",
		);
	}

	async fn handle(
		&self,
		mut client: Socket,
		record: &mut AccessRecord,
	) -> Result<(), ProxyError> {
		let ip = client.peer_addr().ip().to_string();
		let limiter = self.pi.limiters.get_or_create(&ip);
		let watchdog = Watchdog::new(self.pi.cfg.idle_timeout);

		let (request, leftover) = match http1::read_request(&mut client).await {
			Ok(parsed) => parsed,
			Err(e) => {
				let err = match e {
					http1::MessageError::BodyTooLarge => ProxyError::RequestTooLarge,
					other => ProxyError::InvalidRequest(other),
				};
				return Self::reject(client, err).await;
			},
		};

		let class = classify(&request, &self.pi.cfg.blacklist);
		record.connect = class.is_connect;
		record.host = class.host.clone();
		record.port = class.port.clone();

		if class.blacklisted {
			return Self::reject(client, ProxyError::Blacklisted).await;
		}

		let RequestClass { host, port, .. } = class;
		if record.connect {
			tunnel::run(client, &host, &port, leftover, limiter, &watchdog).await
		} else {
			forwarder::run(client, request, &host, &port, limiter, &watchdog).await
		}
	}

	/// Answers with the 400 page the error calls for and ends the session.
	/// The write is best-effort; the client may already be gone.
	async fn reject(mut client: Socket, err: ProxyError) -> Result<(), ProxyError> {
		if let Some(body) = err.response_body() {
			let _ = client.write_all(&http1::bad_request(&body)).await;
		}
		let _ = client.shutdown().await;
		Err(err)
	}
}
