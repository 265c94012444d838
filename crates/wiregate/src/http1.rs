//! Just enough HTTP/1.1 to act as a forwarding proxy: bounded reads of one
//! request, response framing detection for verbatim relay, and request
//! serialization with proxy normalization. Head parsing is delegated to
//! `httparse`; bodies are buffered in full, which is what lets the paced
//! sender count bytes uniformly and retransmit from an offset.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

#[cfg(test)]
#[path = "http1_tests.rs"]
mod tests;

/// Upper bound on the bytes of head (request line + headers) we will buffer.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Hard cap on buffered message bodies. Anything larger must use CONNECT.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const MAX_HEADERS: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
	#[error("malformed message: {0}")]
	Parse(#[from] httparse::Error),
	#[error("message head exceeds {MAX_HEAD_BYTES} bytes")]
	HeadTooLarge,
	#[error("message body exceeds the configured cap")]
	BodyTooLarge,
	#[error("invalid content-length")]
	InvalidContentLength,
	#[error("invalid chunked framing")]
	InvalidChunk,
	#[error("connection closed mid-message")]
	UnexpectedEof,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Header {
	pub name: String,
	pub value: Vec<u8>,
}

/// One parsed request, body already de-framed.
#[derive(Debug, Clone)]
pub struct Request {
	pub method: String,
	pub target: String,
	/// HTTP/1.x minor version.
	pub version: u8,
	pub headers: Vec<Header>,
	pub body: Bytes,
}

impl Request {
	pub fn header(&self, name: &str) -> Option<&[u8]> {
		self
			.headers
			.iter()
			.find(|h| h.name.eq_ignore_ascii_case(name))
			.map(|h| h.value.as_slice())
	}

	pub fn remove_header(&mut self, name: &str) {
		self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
	}

	fn set_header(&mut self, name: &str, value: Vec<u8>) {
		match self
			.headers
			.iter_mut()
			.find(|h| h.name.eq_ignore_ascii_case(name))
		{
			Some(h) => h.value = value,
			None => self.headers.push(Header {
				name: name.to_string(),
				value,
			}),
		}
	}

	/// Rewrites the request so it can be replayed against the origin:
	/// absolute-form targets become origin-form (scheme and authority
	/// stripped; userinfo cannot contain `/`, so cutting at the first slash
	/// after the scheme is exact), hop-by-hop `Proxy-Connection` is dropped,
	/// and a body that arrived chunked is re-framed with a content-length.
	pub fn normalize_for_origin(&mut self) {
		if let Some((_scheme, rest)) = self.target.split_once("://") {
			self.target = match rest.find('/') {
				Some(path_start) => rest[path_start..].to_string(),
				None => "/".to_string(),
			};
		}
		self.remove_header("Proxy-Connection");
		if is_chunked(&self.headers) {
			self.remove_header("Transfer-Encoding");
			self.set_header("Content-Length", self.body.len().to_string().into_bytes());
		}
	}

	/// Flattens the request back into wire form.
	pub fn serialize(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(256 + self.body.len());
		out.extend_from_slice(self.method.as_bytes());
		out.extend_from_slice(b" ");
		out.extend_from_slice(self.target.as_bytes());
		out.extend_from_slice(b" HTTP/1.");
		out.extend_from_slice(&[b'0' + self.version]);
		out.extend_from_slice(b"\r\n");
		for h in &self.headers {
			out.extend_from_slice(h.name.as_bytes());
			out.extend_from_slice(b": ");
			out.extend_from_slice(&h.value);
			out.extend_from_slice(b"\r\n");
		}
		out.extend_from_slice(b"\r\n");
		out.extend_from_slice(&self.body);
		out.freeze()
	}
}

/// Reads one full request. Returns the request plus any bytes the client sent
/// beyond it; for CONNECT those are early tunnel data and must not be lost.
pub async fn read_request<R: AsyncRead + Unpin>(
	r: &mut R,
) -> Result<(Request, Bytes), MessageError> {
	let mut buf = BytesMut::with_capacity(8 * 1024);
	let (head_len, mut request) = loop {
		if let Some(parsed) = try_parse_request(&buf)? {
			break parsed;
		}
		if buf.len() > MAX_HEAD_BYTES {
			return Err(MessageError::HeadTooLarge);
		}
		if r.read_buf(&mut buf).await? == 0 {
			return Err(MessageError::UnexpectedEof);
		}
	};
	buf.advance(head_len);

	if is_chunked(&request.headers) {
		request.body = read_chunked_body(r, &mut buf, MAX_BODY_BYTES).await?;
	} else if let Some(length) = content_length(&request.headers)? {
		if length > MAX_BODY_BYTES {
			return Err(MessageError::BodyTooLarge);
		}
		while buf.len() < length {
			if r.read_buf(&mut buf).await? == 0 {
				return Err(MessageError::UnexpectedEof);
			}
		}
		request.body = buf.split_to(length).freeze();
	}

	Ok((request, buf.freeze()))
}

fn try_parse_request(buf: &[u8]) -> Result<Option<(usize, Request)>, MessageError> {
	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut parsed = httparse::Request::new(&mut headers);
	match parsed.parse(buf)? {
		httparse::Status::Partial => Ok(None),
		httparse::Status::Complete(head_len) => {
			let request = Request {
				method: parsed.method.unwrap_or_default().to_string(),
				target: parsed.path.unwrap_or_default().to_string(),
				version: parsed.version.unwrap_or(1),
				headers: parsed
					.headers
					.iter()
					.map(|h| Header {
						name: h.name.to_string(),
						value: h.value.to_vec(),
					})
					.collect(),
				body: Bytes::new(),
			};
			Ok(Some((head_len, request)))
		},
	}
}

/// Reads one full response without reshaping it: the returned bytes are
/// exactly what came off the wire (head included) so the client sees the
/// origin's message verbatim. Framing is parsed only to find where the
/// message ends and to enforce `max_body` on the payload.
///
/// A response with neither content-length nor chunked framing runs until the
/// origin closes the connection, which is fine here: every session carries
/// exactly one exchange and tears the connection down afterwards.
///
/// `head_response` must be set when the request was HEAD: such responses may
/// advertise a content-length yet carry no body.
pub async fn read_response_raw<R: AsyncRead + Unpin>(
	r: &mut R,
	max_body: usize,
	head_response: bool,
) -> Result<Bytes, MessageError> {
	let mut buf = BytesMut::with_capacity(8 * 1024);
	let (head_len, status, headers) = loop {
		if let Some(parsed) = try_parse_response_head(&buf)? {
			break parsed;
		}
		if buf.len() > MAX_HEAD_BYTES {
			return Err(MessageError::HeadTooLarge);
		}
		if r.read_buf(&mut buf).await? == 0 {
			return Err(MessageError::UnexpectedEof);
		}
	};

	let end = if head_response || bodyless_status(status) {
		head_len
	} else if is_chunked(&headers) {
		scan_chunked_raw(r, &mut buf, head_len, max_body).await?
	} else if let Some(length) = content_length(&headers)? {
		if length > max_body {
			return Err(MessageError::BodyTooLarge);
		}
		let total = head_len + length;
		while buf.len() < total {
			if r.read_buf(&mut buf).await? == 0 {
				return Err(MessageError::UnexpectedEof);
			}
		}
		total
	} else {
		// Close-delimited: drain until EOF.
		loop {
			if buf.len() - head_len > max_body {
				return Err(MessageError::BodyTooLarge);
			}
			if r.read_buf(&mut buf).await? == 0 {
				break;
			}
		}
		buf.len()
	};

	buf.truncate(end);
	Ok(buf.freeze())
}

fn try_parse_response_head(
	buf: &[u8],
) -> Result<Option<(usize, u16, Vec<Header>)>, MessageError> {
	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut parsed = httparse::Response::new(&mut headers);
	match parsed.parse(buf)? {
		httparse::Status::Partial => Ok(None),
		httparse::Status::Complete(head_len) => {
			let headers = parsed
				.headers
				.iter()
				.map(|h| Header {
					name: h.name.to_string(),
					value: h.value.to_vec(),
				})
				.collect();
			Ok(Some((head_len, parsed.code.unwrap_or(0), headers)))
		},
	}
}

fn bodyless_status(status: u16) -> bool {
	matches!(status, 100..=199 | 204 | 304)
}

fn is_chunked(headers: &[Header]) -> bool {
	header_value(headers, "Transfer-Encoding")
		.map(|v| {
			std::str::from_utf8(v)
				.map(|s| s.to_ascii_lowercase().contains("chunked"))
				.unwrap_or(false)
		})
		.unwrap_or(false)
}

fn content_length(headers: &[Header]) -> Result<Option<usize>, MessageError> {
	match header_value(headers, "Content-Length") {
		None => Ok(None),
		Some(v) => std::str::from_utf8(v)
			.ok()
			.and_then(|s| s.trim().parse::<usize>().ok())
			.map(Some)
			.ok_or(MessageError::InvalidContentLength),
	}
}

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
	headers
		.iter()
		.find(|h| h.name.eq_ignore_ascii_case(name))
		.map(|h| h.value.as_slice())
}

/// Decodes a chunked body, discarding the framing. Trailer fields are read
/// and dropped.
async fn read_chunked_body<R: AsyncRead + Unpin>(
	r: &mut R,
	buf: &mut BytesMut,
	max_body: usize,
) -> Result<Bytes, MessageError> {
	let mut out = BytesMut::new();
	loop {
		let line_end = fill_until_crlf(r, buf, 0).await?;
		let size = parse_chunk_size(&buf[..line_end])?;
		buf.advance(line_end + 2);

		if size == 0 {
			loop {
				let trailer_end = fill_until_crlf(r, buf, 0).await?;
				buf.advance(trailer_end + 2);
				if trailer_end == 0 {
					return Ok(out.freeze());
				}
			}
		}

		if out.len() + size > max_body {
			return Err(MessageError::BodyTooLarge);
		}
		while buf.len() < size + 2 {
			if r.read_buf(buf).await? == 0 {
				return Err(MessageError::UnexpectedEof);
			}
		}
		out.extend_from_slice(&buf[..size]);
		if &buf[size..size + 2] != b"\r\n" {
			return Err(MessageError::InvalidChunk);
		}
		buf.advance(size + 2);
	}
}

/// Walks chunked framing without consuming it, returning the offset one past
/// the terminal CRLF. Used on the response path where the raw bytes are
/// relayed as-is.
async fn scan_chunked_raw<R: AsyncRead + Unpin>(
	r: &mut R,
	buf: &mut BytesMut,
	start: usize,
	max_body: usize,
) -> Result<usize, MessageError> {
	let mut pos = start;
	let mut payload = 0usize;
	loop {
		let line_end = fill_until_crlf(r, buf, pos).await?;
		let size = parse_chunk_size(&buf[pos..line_end])?;
		pos = line_end + 2;

		if size == 0 {
			loop {
				let trailer_end = fill_until_crlf(r, buf, pos).await?;
				let empty = trailer_end == pos;
				pos = trailer_end + 2;
				if empty {
					return Ok(pos);
				}
			}
		}

		payload += size;
		if payload > max_body {
			return Err(MessageError::BodyTooLarge);
		}
		while buf.len() < pos + size + 2 {
			if r.read_buf(buf).await? == 0 {
				return Err(MessageError::UnexpectedEof);
			}
		}
		if &buf[pos + size..pos + size + 2] != b"\r\n" {
			return Err(MessageError::InvalidChunk);
		}
		pos += size + 2;
	}
}

/// Returns the absolute offset of the next CRLF at or after `from`, reading
/// more input as needed.
async fn fill_until_crlf<R: AsyncRead + Unpin>(
	r: &mut R,
	buf: &mut BytesMut,
	from: usize,
) -> Result<usize, MessageError> {
	loop {
		if let Some(i) = buf[from..].windows(2).position(|w| w == b"\r\n") {
			return Ok(from + i);
		}
		if buf.len() - from > MAX_HEAD_BYTES {
			return Err(MessageError::InvalidChunk);
		}
		if r.read_buf(buf).await? == 0 {
			return Err(MessageError::UnexpectedEof);
		}
	}
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, MessageError> {
	let line = std::str::from_utf8(line).map_err(|_| MessageError::InvalidChunk)?;
	// Chunk extensions after ';' are legal and ignored.
	let digits = line.split(';').next().unwrap_or("").trim();
	usize::from_str_radix(digits, 16).map_err(|_| MessageError::InvalidChunk)
}

/// The only error page the proxy serves.
pub fn bad_request(body: &str) -> Bytes {
	Bytes::from(format!(
		"HTTP/1.1 400 Bad Request\r\nServer: Proxy\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
		body.len(),
		body
	))
}

/// Sent to the client once the CONNECT target is reachable.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
