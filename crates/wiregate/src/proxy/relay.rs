//! The per-session relay engine: a shared termination latch, the paced copy
//! loops both handlers are built from, and origin establishment under
//! watchdog supervision.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::proxy::ProxyError;
use crate::shaping::Limiter;
use crate::transport::stream::{Socket, authority};
use crate::watchdog::Watchdog;

/// Read granularity of the relay loops.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;
/// How long a starved direction sleeps before asking the limiter again.
pub const STARVATION_POLL: Duration = Duration::from_millis(10);

/// Termination state shared by the two directions of a session and the
/// watchdog callback.
///
/// The token is the "finished" flag: loops poll it at each iteration and
/// select against it while blocked, so tripping it wakes everything. The
/// atomic guards the teardown itself, which must run exactly once no matter
/// how many parties race to report the end of the session.
pub struct RelayState {
	finished: CancellationToken,
	torn_down: AtomicBool,
}

impl RelayState {
	pub fn new() -> Arc<Self> {
		Arc::new(RelayState {
			finished: CancellationToken::new(),
			torn_down: AtomicBool::new(false),
		})
	}

	pub fn finished(&self) -> bool {
		self.finished.is_cancelled()
	}

	pub async fn cancelled(&self) {
		self.finished.cancelled().await
	}

	/// Marks the session finished. This is the whole job of the watchdog
	/// callback; it must stay free of locks the watchdog itself holds.
	pub fn trip(&self) {
		self.finished.cancel();
	}

	/// The single teardown gate. The first caller disarms the watchdog and
	/// trips the finished token, waking the companion direction out of any
	/// pending I/O; every direction then shuts down its write half on the way
	/// out. Subsequent calls are no-ops, which is what makes session teardown
	/// idempotent.
	pub fn begin_teardown(&self, watchdog: &Watchdog) -> bool {
		if self.torn_down.swap(true, Ordering::AcqRel) {
			return false;
		}
		watchdog.stop();
		self.finished.cancel();
		true
	}
}

/// Resolves `host:port` and connects, refreshing the watchdog after each
/// step. The caller has the watchdog callback tripping `state`, so an idle
/// expiry cancels whichever of the two operations is pending.
pub async fn establish(
	host: &str,
	port: &str,
	watchdog: &Watchdog,
	state: &RelayState,
) -> Result<Socket, ProxyError> {
	let target = authority(host, port);
	let addrs = tokio::select! {
		_ = state.cancelled() => return Err(ProxyError::IdleTimeout),
		res = tokio::net::lookup_host(target.as_str()) => res.map_err(ProxyError::Connect)?,
	};
	watchdog.refresh();

	let mut last_err = None;
	for addr in addrs {
		let connected = tokio::select! {
			_ = state.cancelled() => return Err(ProxyError::IdleTimeout),
			res = TcpStream::connect(addr) => res,
		};
		match connected {
			Ok(stream) => {
				watchdog.refresh();
				return Socket::from_tcp(stream).map_err(ProxyError::Connect);
			},
			Err(e) => last_err = Some(e),
		}
	}
	Err(ProxyError::Connect(last_err.unwrap_or_else(|| {
		io::Error::new(
			io::ErrorKind::NotFound,
			format!("no addresses resolved for {target}"),
		)
	})))
}

/// Writes `buf` to `dst` at the pace the limiter allows. A zero grant means
/// the bucket is dry: sleep a beat and ask again, unless the session has been
/// declared finished in the meantime. The watchdog is refreshed after every
/// completed write so a slow but moving stream is never reaped.
pub async fn send_paced<W: AsyncWrite + Unpin>(
	dst: &mut W,
	buf: &[u8],
	limiter: &Limiter,
	watchdog: &Watchdog,
	state: &RelayState,
) -> io::Result<()> {
	let mut off = 0;
	while off < buf.len() {
		if state.finished() {
			break;
		}
		let allowed = limiter.acquire(buf.len() - off);
		if allowed == 0 {
			tokio::select! {
				_ = state.cancelled() => break,
				_ = tokio::time::sleep(STARVATION_POLL) => {},
			}
			continue;
		}
		dst.write_all(&buf[off..off + allowed]).await?;
		watchdog.refresh();
		off += allowed;
	}
	Ok(())
}

/// One relay direction: read a chunk, deliver it fully through the pacer,
/// repeat until EOF, an I/O error, or the finished flag. Bytes keep their
/// order; nothing beyond the in-flight chunk is ever buffered.
pub async fn copy_paced<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
	src: &mut R,
	dst: &mut W,
	limiter: &Limiter,
	watchdog: &Watchdog,
	state: &RelayState,
) -> io::Result<u64> {
	let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
	let mut total = 0u64;
	loop {
		if state.finished() {
			break;
		}
		let n = tokio::select! {
			_ = state.cancelled() => break,
			res = src.read(&mut buf) => res?,
		};
		if n == 0 {
			break;
		}
		watchdog.refresh();
		send_paced(dst, &buf[..n], limiter, watchdog, state).await?;
		total += n as u64;
	}
	Ok(total)
}

/// AsyncRead adapter that refreshes the watchdog on every successful read, so
/// multi-read operations (like buffering a response) count as progress
/// without threading the watchdog through them.
pub struct WatchdogReader<'a, R> {
	inner: R,
	watchdog: &'a Watchdog,
}

impl<'a, R> WatchdogReader<'a, R> {
	pub fn new(inner: R, watchdog: &'a Watchdog) -> Self {
		WatchdogReader { inner, watchdog }
	}
}

impl<R: AsyncRead + Unpin> AsyncRead for WatchdogReader<'_, R> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		let before = buf.filled().len();
		let poll = Pin::new(&mut me.inner).poll_read(cx, buf);
		if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
			me.watchdog.refresh();
		}
		poll
	}
}

#[cfg(test)]
mod tests {
	use std::num::NonZeroU64;

	use super::*;

	#[tokio::test]
	async fn teardown_runs_exactly_once() {
		let state = RelayState::new();
		let watchdog = Watchdog::new(Duration::from_secs(5));
		watchdog.start();

		assert!(state.begin_teardown(&watchdog));
		assert!(state.finished());
		// Late arrivals (the companion direction, a second error path) get a
		// no-op, never a second teardown.
		assert!(!state.begin_teardown(&watchdog));
		assert!(!state.begin_teardown(&watchdog));
	}

	#[tokio::test]
	async fn tripping_wakes_a_blocked_direction() {
		let state = RelayState::new();
		let blocked = {
			let state = state.clone();
			tokio::spawn(async move { state.cancelled().await })
		};
		state.trip();
		tokio::time::timeout(Duration::from_secs(1), blocked)
			.await
			.expect("cancelled() must resolve once tripped")
			.unwrap();
	}

	#[tokio::test]
	async fn copy_delivers_everything_in_order() {
		let (mut client_end, mut src) = tokio::io::duplex(1024);
		let (mut dst, mut sink_end) = tokio::io::duplex(64 * 1024);
		let limiter = Limiter::new(NonZeroU64::new(1 << 30).unwrap(), Default::default());
		let watchdog = Watchdog::new(Duration::from_secs(5));
		let state = RelayState::new();

		let payload = b"through the relay ".repeat(200);
		let writer = {
			let payload = payload.clone();
			tokio::spawn(async move {
				client_end.write_all(&payload).await.unwrap();
				// Dropping the write end is the EOF that stops the loop.
			})
		};

		let moved = copy_paced(&mut src, &mut dst, &limiter, &watchdog, &state)
			.await
			.unwrap();
		writer.await.unwrap();
		assert_eq!(moved as usize, payload.len());

		drop(dst);
		let mut got = Vec::new();
		sink_end.read_to_end(&mut got).await.unwrap();
		assert_eq!(got, payload);
	}

	#[tokio::test]
	async fn finished_state_stops_the_loop_before_reading() {
		let (_client_end, mut src) = tokio::io::duplex(64);
		let (mut dst, _sink_end) = tokio::io::duplex(64);
		let limiter = Limiter::new(NonZeroU64::new(1000).unwrap(), Default::default());
		let watchdog = Watchdog::new(Duration::from_secs(5));
		let state = RelayState::new();

		state.trip();
		// The peer never sends anything, so only the finished flag can make
		// this return.
		let moved = copy_paced(&mut src, &mut dst, &limiter, &watchdog, &state)
			.await
			.unwrap();
		assert_eq!(moved, 0);
	}
}
