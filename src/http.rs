//! Synchronous HTTP client.
//!
//! Independent of the readiness registry: each `post` runs one complete
//! request/response cycle on the calling thread over a dedicated connection,
//! with exactly one of the error or completion callbacks firing per call.

use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use tracing::debug;

use crate::error::{HttpError, TlsError};
use crate::tls;

/// Fixed user agent sent with every request.
pub const USER_AGENT: &str = concat!("netlane/", env!("CARGO_PKG_VERSION"));

const MAX_HEADER_BYTES: usize = 64 * 1024;

pub type HttpErrorHandler = Box<dyn FnOnce(HttpError) + Send>;

/// Receives the ordered raw response header lines (status line first, CRLF
/// boundaries removed, no key/value parsing) and the body bytes.
pub type HttpCompletionHandler = Box<dyn FnOnce(Vec<String>, Vec<u8>) + Send>;

/// One-request-per-call HTTP client.
///
/// A trust anchor makes https connections verify against that anchor plus
/// the platform roots. Without one, server verification is disabled
/// entirely; that is deliberate for development against self-signed hosts
/// and unsafe anywhere else.
pub struct HttpClient {
	trust_anchor: Option<Vec<u8>>,
	connect_timeout: Duration,
}

impl HttpClient {
	pub fn new() -> HttpClient {
		HttpClient {
			trust_anchor: None,
			connect_timeout: Duration::from_secs(5),
		}
	}

	pub fn with_trust_anchor(cert_pem: Vec<u8>) -> HttpClient {
		HttpClient {
			trust_anchor: Some(cert_pem),
			connect_timeout: Duration::from_secs(5),
		}
	}

	pub fn set_timeout(&mut self, timeout: Duration) {
		self.connect_timeout = timeout;
	}

	/// Issues a single POST.
	///
	/// Caller headers go out in slice order after Host, User-Agent and
	/// Content-Length. Any non-200 status is an error carrying that status.
	/// Exactly one of the two callbacks fires.
	pub fn post(
		&self,
		url: &str,
		headers: &[(String, String)],
		body: &[u8],
		on_error: HttpErrorHandler,
		on_complete: HttpCompletionHandler,
	) {
		match self.do_post(url, headers, body) {
			Ok((header_lines, response_body)) => on_complete(header_lines, response_body),
			Err(e) => {
				debug!(url, error = %e, "http post failed");
				on_error(e);
			}
		}
	}

	fn do_post(
		&self,
		url: &str,
		headers: &[(String, String)],
		body: &[u8],
	) -> Result<(Vec<String>, Vec<u8>), HttpError> {
		let target = parse_url(url)?;

		let addr = (target.host.as_str(), target.port)
			.to_socket_addrs()?
			.next()
			.ok_or(HttpError::Url { reason: "host did not resolve" })?;
		let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)?;

		let mut stream = if target.https {
			let config = match &self.trust_anchor {
				Some(pem) => tls::client_config(Some(pem))?,
				None => tls::client_config_unverified(),
			};
			let name = ServerName::try_from(target.host.clone()).map_err(|_| {
				TlsError::InvalidServerName {
					name: target.host.clone(),
				}
			})?;
			let conn = ClientConnection::new(config, name)
				.map_err(|e| TlsError::Session { reason: e.to_string() })?;
			HttpStream::Tls(Box::new(StreamOwned::new(conn, tcp)))
		} else {
			HttpStream::Plain(tcp)
		};

		let mut request = Vec::with_capacity(256 + body.len());
		write!(request, "POST {} HTTP/1.1\r\n", target.path)?;
		write!(request, "Host: {}\r\n", target.host_header)?;
		write!(request, "User-Agent: {}\r\n", USER_AGENT)?;
		write!(request, "Content-Length: {}\r\n", body.len())?;
		for (name, value) in headers {
			write!(request, "{}: {}\r\n", name, value)?;
		}
		request.extend_from_slice(b"\r\n");
		request.extend_from_slice(body);

		stream.write_all(&request)?;
		stream.flush()?;

		let mut reader = BufReader::new(stream);
		let raw = read_header_block(&mut reader)?;
		let header_lines = split_header_lines(&raw);

		let status = parse_status(header_lines.first())?;
		if status != 200 {
			return Err(HttpError::Status { code: status });
		}

		let length = content_length(&header_lines)?;
		let mut response_body = vec![0u8; length];
		reader.read_exact(&mut response_body)?;

		Ok((header_lines, response_body))
	}
}

impl Default for HttpClient {
	fn default() -> HttpClient {
		HttpClient::new()
	}
}

enum HttpStream {
	Plain(TcpStream),
	Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for HttpStream {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		match self {
			HttpStream::Plain(s) => s.read(buf),
			HttpStream::Tls(s) => s.read(buf),
		}
	}
}

impl Write for HttpStream {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		match self {
			HttpStream::Plain(s) => s.write(buf),
			HttpStream::Tls(s) => s.write(buf),
		}
	}

	fn flush(&mut self) -> std::io::Result<()> {
		match self {
			HttpStream::Plain(s) => s.flush(),
			HttpStream::Tls(s) => s.flush(),
		}
	}
}

struct Target {
	https: bool,
	host: String,
	port: u16,
	path: String,
	host_header: String,
}

fn parse_url(url: &str) -> Result<Target, HttpError> {
	let (https, rest) = if let Some(rest) = url.strip_prefix("https://") {
		(true, rest)
	} else if let Some(rest) = url.strip_prefix("http://") {
		(false, rest)
	} else {
		return Err(HttpError::Url { reason: "scheme must be http or https" });
	};

	let (authority, path) = match rest.find('/') {
		Some(i) => (&rest[..i], &rest[i..]),
		None => (rest, "/"),
	};

	let (host, port) = match authority.rsplit_once(':') {
		Some((host, port)) => (
			host,
			port.parse::<u16>().map_err(|_| HttpError::Url { reason: "bad port" })?,
		),
		None => (authority, if https { 443 } else { 80 }),
	};
	if host.is_empty() {
		return Err(HttpError::Url { reason: "missing host" });
	}

	let default_port = port == if https { 443 } else { 80 };
	let host_header = if default_port {
		host.to_string()
	} else {
		format!("{}:{}", host, port)
	};

	Ok(Target {
		https,
		host: host.to_string(),
		port,
		path: path.to_string(),
		host_header,
	})
}

/// Reads up to and including the CRLFCRLF header terminator.
fn read_header_block<R: Read>(reader: &mut R) -> Result<Vec<u8>, HttpError> {
	let mut raw = Vec::new();
	let mut byte = [0u8; 1];
	while !raw.ends_with(b"\r\n\r\n") {
		if raw.len() >= MAX_HEADER_BYTES {
			return Err(HttpError::OversizedHeaders { limit: MAX_HEADER_BYTES });
		}
		let n = reader.read(&mut byte)?;
		if n == 0 {
			return Err(HttpError::Malformed {
				reason: "connection closed inside header block",
			});
		}
		raw.push(byte[0]);
	}
	Ok(raw)
}

/// Splits the header block on CRLF boundaries into raw, unparsed lines.
fn split_header_lines(raw: &[u8]) -> Vec<String> {
	String::from_utf8_lossy(raw)
		.split("\r\n")
		.filter(|line| !line.is_empty())
		.map(|line| line.to_string())
		.collect()
}

fn parse_status(status_line: Option<&String>) -> Result<u16, HttpError> {
	let line = status_line.ok_or(HttpError::Malformed { reason: "empty header block" })?;
	line.split_whitespace()
		.nth(1)
		.and_then(|code| code.parse().ok())
		.ok_or(HttpError::Malformed { reason: "unparseable status line" })
}

fn content_length(header_lines: &[String]) -> Result<usize, HttpError> {
	for line in header_lines {
		if let Some((name, value)) = line.split_once(':') {
			if name.trim().eq_ignore_ascii_case("content-length") {
				return value
					.trim()
					.parse()
					.map_err(|_| HttpError::Malformed { reason: "bad content-length" });
			}
		}
	}
	Err(HttpError::Malformed { reason: "missing content-length" })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_plain_url_with_defaults() {
		let t = parse_url("http://example.com/path/to").unwrap();
		assert!(!t.https);
		assert_eq!(t.host, "example.com");
		assert_eq!(t.port, 80);
		assert_eq!(t.path, "/path/to");
		assert_eq!(t.host_header, "example.com");
	}

	#[test]
	fn parses_https_url_with_port() {
		let t = parse_url("https://example.com:8443").unwrap();
		assert!(t.https);
		assert_eq!(t.port, 8443);
		assert_eq!(t.path, "/");
		assert_eq!(t.host_header, "example.com:8443");
	}

	#[test]
	fn rejects_unknown_scheme_and_empty_host() {
		assert!(matches!(parse_url("ftp://x"), Err(HttpError::Url { .. })));
		assert!(matches!(parse_url("http://"), Err(HttpError::Url { .. })));
		assert!(matches!(parse_url("http://:8080/x"), Err(HttpError::Url { .. })));
	}

	#[test]
	fn reads_and_splits_header_block() {
		let mut input = std::io::Cursor::new(
			b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nX-Test: 1\r\n\r\nbody".to_vec(),
		);
		let raw = read_header_block(&mut input).unwrap();
		let lines = split_header_lines(&raw);
		assert_eq!(
			lines,
			vec!["HTTP/1.1 200 OK", "Content-Length: 4", "X-Test: 1"]
		);
		assert_eq!(parse_status(lines.first()).unwrap(), 200);
		assert_eq!(content_length(&lines).unwrap(), 4);
	}

	#[test]
	fn truncated_header_block_is_malformed() {
		let mut input = std::io::Cursor::new(b"HTTP/1.1 200 OK\r\n".to_vec());
		assert!(matches!(
			read_header_block(&mut input),
			Err(HttpError::Malformed { .. })
		));
	}

	#[test]
	fn missing_content_length_is_malformed() {
		let lines = vec!["HTTP/1.1 200 OK".to_string()];
		assert!(matches!(
			content_length(&lines),
			Err(HttpError::Malformed { .. })
		));
	}
}
