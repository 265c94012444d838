use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiregate::Config;
use wiregate::app::Bound;

pub struct TestProxy {
	pub address: SocketAddr,
	_bound: Bound,
}

pub async fn start_proxy(cfg: Config) -> TestProxy {
	let bound = wiregate::app::run(Arc::new(cfg)).await.unwrap();
	TestProxy {
		address: bound.address,
		_bound: bound,
	}
}

pub fn test_config(bandwidth: u64, timeout: Duration, blacklist: &[&str]) -> Config {
	Config {
		bind_addr: "127.0.0.1:0".to_string(),
		max_connections: 256,
		idle_timeout: timeout,
		bandwidth_per_sec: NonZeroU64::new(bandwidth).unwrap(),
		blacklist: blacklist.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
	}
}

/// A high enough rate that shaping never bites in functional tests.
pub const UNLIMITED: u64 = 1 << 40;

/// TCP origin that echoes whatever it receives.
pub async fn echo_origin() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut sock, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = [0u8; 4096];
				loop {
					match sock.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(n) => {
							if sock.write_all(&buf[..n]).await.is_err() {
								break;
							}
						},
					}
				}
			});
		}
	});
	addr
}

/// TCP origin that accepts and then says nothing, for idle-timeout tests.
pub async fn silent_origin() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut sock, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = [0u8; 1024];
				// Hold the connection open, consuming anything sent, until
				// the peer goes away.
				while !matches!(sock.read(&mut buf).await, Ok(0) | Err(_)) {}
			});
		}
	});
	addr
}

/// TCP origin that floods zeros as fast as the socket accepts them, for
/// rate-limit tests.
pub async fn flood_origin() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut sock, _)) = listener.accept().await {
			tokio::spawn(async move {
				let chunk = [0u8; 16 * 1024];
				while sock.write_all(&chunk).await.is_ok() {}
			});
		}
	});
	addr
}

/// Opens a CONNECT tunnel through the proxy and asserts on the 200.
pub async fn connect_via(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
	let mut stream = TcpStream::connect(proxy).await.unwrap();
	stream
		.write_all(format!("CONNECT {target} HTTP/1.1\r\n\r\n").as_bytes())
		.await
		.unwrap();

	let mut got = Vec::new();
	let mut buf = [0u8; 1024];
	loop {
		let n = stream.read(&mut buf).await.unwrap();
		assert!(n > 0, "proxy closed the connection during CONNECT");
		got.extend_from_slice(&buf[..n]);
		if got.windows(4).any(|w| w == b"\r\n\r\n") {
			break;
		}
	}
	let head = String::from_utf8_lossy(&got);
	assert!(
		head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
		"unexpected CONNECT response: {head}"
	);
	stream
}

/// Reads until the deadline or EOF, returning the byte count.
pub async fn read_for(stream: &mut TcpStream, dur: Duration) -> usize {
	let deadline = tokio::time::Instant::now() + dur;
	let mut buf = [0u8; 4096];
	let mut total = 0;
	loop {
		tokio::select! {
			_ = tokio::time::sleep_until(deadline) => break,
			res = stream.read(&mut buf) => match res {
				Ok(0) | Err(_) => break,
				Ok(n) => total += n,
			},
		}
	}
	total
}
