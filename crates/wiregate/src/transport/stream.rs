use std::io::{Error, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A client or origin connection. The enum keeps tests honest: integration
/// fixtures drive sessions over in-memory duplex pipes with the exact code
/// paths production TCP uses.
pub struct Socket {
	peer_addr: SocketAddr,
	counter: BytesCounter,
	inner: SocketType,
}

pub enum SocketType {
	Tcp(TcpStream),
	Memory(DuplexStream),
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
		stream.set_nodelay(true)?;
		Ok(Socket {
			peer_addr: stream.peer_addr()?,
			counter: BytesCounter::default(),
			inner: SocketType::Tcp(stream),
		})
	}

	pub fn from_memory(stream: DuplexStream, peer_addr: SocketAddr) -> Self {
		Socket {
			peer_addr,
			counter: BytesCounter::default(),
			inner: SocketType::Memory(stream),
		}
	}

	pub fn peer_addr(&self) -> SocketAddr {
		self.peer_addr
	}

	/// The counter stays valid after the socket is consumed by a handler;
	/// sessions grab a clone up front to report totals when they finish.
	pub fn counter(&self) -> BytesCounter {
		self.counter.clone()
	}
}

/// Joins host and port into a resolvable authority, restoring the brackets an
/// IPv6 literal needs.
pub fn authority(host: &str, port: &str) -> String {
	if host.contains(':') {
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	}
}

impl AsyncRead for SocketType {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Memory(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Memory(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Memory(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Memory(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Memory(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			SocketType::Tcp(inner) => inner.is_write_vectored(),
			SocketType::Memory(inner) => inner.is_write_vectored(),
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let before = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		self.counter.recv(buf.filled().len() - before);
		poll
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Poll::Ready(Ok(n)) = poll {
			self.counter.sent(n);
		}
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
		if let Poll::Ready(Ok(n)) = poll {
			self.counter.sent(n);
		}
		poll
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

/// Bytes moved through a socket, split by direction. `sent` counts bytes
/// written to the peer, `recv` bytes read from it.
#[derive(Default, Debug, Clone)]
pub struct BytesCounter {
	counts: Arc<(AtomicU64, AtomicU64)>,
}

impl BytesCounter {
	pub fn sent(&self, amt: usize) {
		self.counts.0.fetch_add(amt as u64, Ordering::Relaxed);
	}

	pub fn recv(&self, amt: usize) {
		self.counts.1.fetch_add(amt as u64, Ordering::Relaxed);
	}

	pub fn load(&self) -> (u64, u64) {
		(
			self.counts.0.load(Ordering::Relaxed),
			self.counts.1.load(Ordering::Relaxed),
		)
	}
}
