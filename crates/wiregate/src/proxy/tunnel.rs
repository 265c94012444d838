use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, split};
use tracing::debug;

use crate::http1;
use crate::proxy::ProxyError;
use crate::proxy::relay::{RelayState, copy_paced, establish, send_paced};
use crate::shaping::Limiter;
use crate::transport::stream::Socket;
use crate::watchdog::Watchdog;

/// CONNECT handler: open the origin, confirm with a 200, then relay opaque
/// bytes both ways until either side ends or the watchdog gives up. No
/// parsing happens past the 200; TLS, HTTP/2 or anything else rides through
/// untouched.
pub async fn run(
	mut client: Socket,
	host: &str,
	port: &str,
	early_data: Bytes,
	limiter: Arc<Limiter>,
	watchdog: &Watchdog,
) -> Result<(), ProxyError> {
	let state = RelayState::new();

	// During resolve/connect there is no relay to observe progress on; expiry
	// cancels the pending attempt directly.
	let establish_state = state.clone();
	watchdog.set_callback(move || establish_state.trip());
	watchdog.start();

	let origin = match establish(host, port, watchdog, &state).await {
		Ok(origin) => origin,
		Err(e) => {
			watchdog.stop();
			let _ = client
				.write_all(&http1::bad_request(&e.to_string()))
				.await;
			return Err(e);
		},
	};

	if let Err(e) = client.write_all(http1::CONNECTION_ESTABLISHED).await {
		watchdog.stop();
		return Err(e.into());
	}
	watchdog.refresh();

	// From here on expiry just marks the session finished; the relay loops
	// notice and run the shared teardown.
	let timeout_state = state.clone();
	watchdog.set_callback(move || timeout_state.trip());

	let (mut client_rd, mut client_wr) = split(client);
	let (mut origin_rd, mut origin_wr) = split(origin);

	let client_to_origin = async {
		let mut res = if early_data.is_empty() {
			Ok(0)
		} else {
			// Bytes the client sent ahead of our 200 belong to the tunnel.
			send_paced(&mut origin_wr, &early_data, &limiter, watchdog, &state)
				.await
				.map(|()| early_data.len() as u64)
		};
		if res.is_ok() {
			res = copy_paced(&mut client_rd, &mut origin_wr, &limiter, watchdog, &state).await;
		}
		state.begin_teardown(watchdog);
		let _ = origin_wr.shutdown().await;
		res
	};
	let origin_to_client = async {
		let res = copy_paced(&mut origin_rd, &mut client_wr, &limiter, watchdog, &state).await;
		state.begin_teardown(watchdog);
		let _ = client_wr.shutdown().await;
		res
	};

	let (sent, received) = tokio::join!(client_to_origin, origin_to_client);
	debug!(
		sent = sent.unwrap_or(0),
		received = received.unwrap_or(0),
		"tunnel closed"
	);
	Ok(())
}
