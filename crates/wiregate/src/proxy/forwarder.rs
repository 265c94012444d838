use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, split};
use tracing::debug;

use crate::http1;
use crate::proxy::ProxyError;
use crate::proxy::relay::{RelayState, WatchdogReader, establish, send_paced};
use crate::shaping::Limiter;
use crate::transport::stream::Socket;
use crate::watchdog::Watchdog;

/// Plain-HTTP handler: one request out, one response back, both buffered in
/// full and pushed through the pacer. Buffering keeps the shaping loop
/// byte-addressable; the 64 MiB cap bounds it, and anything bigger belongs on
/// the CONNECT path.
pub async fn run(
	mut client: Socket,
	mut request: http1::Request,
	host: &str,
	port: &str,
	limiter: Arc<Limiter>,
	watchdog: &Watchdog,
) -> Result<(), ProxyError> {
	let state = RelayState::new();

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

	if request.body.len() > http1::MAX_BODY_BYTES {
		watchdog.stop();
		let _ = client
			.write_all(&http1::bad_request("Error: HTTP request too large!"))
			.await;
		return Err(ProxyError::RequestTooLarge);
	}

	request.normalize_for_origin();
	let head_request = request.method == "HEAD";
	let wire = request.serialize();

	let timeout_state = state.clone();
	watchdog.set_callback(move || timeout_state.trip());

	let (origin_rd, mut origin_wr) = split(origin);

	let send_request = async {
		let res = send_paced(&mut origin_wr, &wire, &limiter, watchdog, &state).await;
		if res.is_err() {
			// The origin went away while we were still sending; no response
			// can follow, so bring the whole session down.
			state.begin_teardown(watchdog);
		}
		res
	};

	let relay_response = async {
		let mut reader = WatchdogReader::new(origin_rd, watchdog);
		let raw = tokio::select! {
			_ = state.cancelled() => Err(http1::MessageError::Io(io::Error::new(
				io::ErrorKind::TimedOut,
				"session finished before the response completed",
			))),
			res = http1::read_response_raw(&mut reader, http1::MAX_BODY_BYTES, head_request) => res,
		};
		let res = match raw {
			Ok(raw) => send_paced(&mut client, &raw, &limiter, watchdog, &state)
				.await
				.map_err(ProxyError::Io),
			// Includes a response body over the cap: the client simply sees
			// the session close, never a rewritten status.
			Err(http1::MessageError::BodyTooLarge) => Err(ProxyError::ResponseTooLarge),
			Err(http1::MessageError::Io(e)) => Err(ProxyError::Io(e)),
			Err(e) => Err(ProxyError::Io(io::Error::new(io::ErrorKind::InvalidData, e))),
		};
		state.begin_teardown(watchdog);
		let _ = client.shutdown().await;
		res
	};

	let (sent, relayed) = tokio::join!(send_request, relay_response);
	state.begin_teardown(watchdog);
	if let Err(e) = sent {
		debug!("request forwarding ended early: {e}");
	}
	relayed
}
