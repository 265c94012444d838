use std::collections::HashSet;

use crate::http1::Request;

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;

/// Where the first request on a connection wants to go, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestClass {
	pub is_connect: bool,
	pub host: String,
	pub port: String,
	pub blacklisted: bool,
}

/// Pure classification of a parsed request. CONNECT targets carry the
/// authority in the request target (`host[:port]`, default 443); everything
/// else names its origin in the `Host` header (default 80). No resolution
/// happens here.
pub fn classify(req: &Request, blacklist: &HashSet<String>) -> RequestClass {
	let is_connect = req.method == "CONNECT";
	let (host, port) = if is_connect {
		split_host_port(&req.target, "443")
	} else {
		let host_header = req
			.header("Host")
			.map(|v| String::from_utf8_lossy(v).into_owned())
			.unwrap_or_default();
		split_host_port(&host_header, "80")
	};
	let blacklisted = blacklist.contains(&host);
	RequestClass {
		is_connect,
		host,
		port,
		blacklisted,
	}
}

/// Splits `host[:port]`. A bracketed IPv6 literal keeps its colons: the host
/// comes back without brackets and the port is whatever follows `]:`. For
/// everything else the split is at the first colon, with the remainder kept
/// verbatim as the port string.
pub fn split_host_port(input: &str, default_port: &str) -> (String, String) {
	if let Some(rest) = input.strip_prefix('[') {
		if let Some(end) = rest.find(']') {
			let host = rest[..end].to_string();
			let port = match rest[end + 1..].strip_prefix(':') {
				Some(p) => p.to_string(),
				None => default_port.to_string(),
			};
			return (host, port);
		}
	}
	match input.split_once(':') {
		Some((host, port)) => (host.to_string(), port.to_string()),
		None => (input.to_string(), default_port.to_string()),
	}
}
