/// Socket setup errors: resolution, creation, option configuration.
///
/// These happen before a socket ever joins the readiness registry, so the
/// registry never observes a half-built socket.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
	#[error("getaddrinfo({host}) failed: {detail}")]
	Resolve { code: i32, host: String, detail: String },

	#[error("socket() failed: {}", errno_to_str(*.errno))]
	Create { errno: i32 },

	#[error("setsockopt({option}) failed: {}", errno_to_str(*.errno))]
	SetOption { errno: i32, option: &'static str },

	#[error("getsockopt({option}) failed: {}", errno_to_str(*.errno))]
	GetOption { errno: i32, option: &'static str },
}

impl SocketError {
	/// Numeric error code for callback reporting (errno or gai code).
	pub fn code(&self) -> i32 {
		match self {
			SocketError::Resolve { code, .. } => *code,
			SocketError::Create { errno }
			| SocketError::SetOption { errno, .. }
			| SocketError::GetOption { errno, .. } => *errno,
		}
	}
}

/// Connect-phase errors.
///
/// `TimedOut` is a distinguished variant so callers can tell a slow network
/// from an active refusal (which arrives as `Connect` with ECONNREFUSED).
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
	#[error(transparent)]
	Socket(#[from] SocketError),

	#[error("connect() failed: {}", errno_to_str(*.errno))]
	Connect { errno: i32 },

	#[error("select() failed during connect: {}", errno_to_str(*.errno))]
	SelectFailed { errno: i32 },

	#[error("connect timed out")]
	TimedOut,

	#[error("select() returned without readiness")]
	NoReadiness,

	#[error("connection attempt already in progress")]
	Busy,

	#[error(transparent)]
	Tls(#[from] TlsError),
}

impl ConnectError {
	pub fn timed_out(&self) -> bool {
		matches!(self, ConnectError::TimedOut)
	}

	/// Numeric error code for callback reporting; zero when the failure has
	/// no OS code (timeout, busy, missing readiness).
	pub fn code(&self) -> i32 {
		match self {
			ConnectError::Socket(e) => e.code(),
			ConnectError::Connect { errno } | ConnectError::SelectFailed { errno } => *errno,
			ConnectError::TimedOut
			| ConnectError::NoReadiness
			| ConnectError::Busy
			| ConnectError::Tls(_) => 0,
		}
	}
}

/// I/O errors on an established connection or datagram socket.
///
/// All of these are connection-fatal: the socket is closed before the
/// callback carrying the error fires, so no further I/O callbacks follow.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
	#[error("send failed: {}", errno_to_str(*.errno))]
	Send { errno: i32 },

	#[error("recv failed: {}", errno_to_str(*.errno))]
	Recv { errno: i32 },

	#[error("connection closed by peer")]
	Closed,

	#[error("tls error: {reason}")]
	Tls { reason: String },
}

impl IoError {
	pub fn code(&self) -> i32 {
		match self {
			IoError::Send { errno } | IoError::Recv { errno } => *errno,
			IoError::Closed | IoError::Tls { .. } => 0,
		}
	}
}

/// TLS configuration and handshake errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error("trust anchor rejected: {reason}")]
	InvalidAnchor { reason: String },

	#[error("invalid tls server name: {name}")]
	InvalidServerName { name: String },

	#[error("tls session setup failed: {reason}")]
	Session { reason: String },

	#[error("tls handshake failed: {reason}")]
	Handshake { reason: String },
}

/// HTTP client errors.
///
/// `Status` carries the non-200 response code; everything else is a
/// transport or framing failure underneath the request.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
	#[error("bad url: {reason}")]
	Url { reason: &'static str },

	#[error("http response code {code}")]
	Status { code: u16 },

	#[error("http transport error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Tls(#[from] TlsError),

	#[error("response header block exceeds {limit} bytes")]
	OversizedHeaders { limit: usize },

	#[error("malformed response: {reason}")]
	Malformed { reason: &'static str },
}

impl HttpError {
	/// Status-or-error code for the error callback: the HTTP status for
	/// `Status`, the OS error for `Io`, zero otherwise.
	pub fn code(&self) -> i32 {
		match self {
			HttpError::Status { code } => i32::from(*code),
			HttpError::Io(e) => e.raw_os_error().unwrap_or(0),
			_ => 0,
		}
	}
}

/// Returns current errno value.
#[inline]
pub fn errno() -> i32 {
	std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Converts errno to human-readable string.
fn errno_to_str(errno: i32) -> String {
	match errno {
		libc::EACCES => "permission denied".into(),
		libc::EADDRINUSE => "address already in use".into(),
		libc::EADDRNOTAVAIL => "address not available".into(),
		libc::EAFNOSUPPORT => "address family not supported".into(),
		libc::EAGAIN => "resource temporarily unavailable".into(),
		libc::EBADF => "bad file descriptor".into(),
		libc::ECONNREFUSED => "connection refused".into(),
		libc::ECONNRESET => "connection reset by peer".into(),
		libc::EHOSTUNREACH => "host unreachable".into(),
		libc::EINPROGRESS => "operation in progress".into(),
		libc::EINTR => "interrupted by signal".into(),
		libc::EINVAL => "invalid argument".into(),
		libc::EMFILE => "too many open files".into(),
		libc::ENETUNREACH => "network unreachable".into(),
		libc::ENOBUFS => "no buffer space available".into(),
		libc::ENOTCONN => "not connected".into(),
		libc::EPIPE => "broken pipe".into(),
		libc::ETIMEDOUT => "connection timed out".into(),
		_ => format!("errno {}", errno),
	}
}
