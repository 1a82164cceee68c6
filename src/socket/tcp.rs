use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::ClientConnection;
use rustls::pki_types::ServerName;
use tracing::info;

use crate::addr::Endpoint;
use crate::error::{ConnectError, IoError, TlsError, errno};
use crate::poll::{self, Pollable};
use crate::socket::RECV_CHUNK;
use crate::socket::base::Socket;
use crate::tls;

/// Fires exactly once per connect attempt. The endpoint is present whenever
/// resolution succeeded, so a failed attempt can still log which address was
/// tried.
pub type ConnectHandler = Box<dyn FnOnce(Result<(), ConnectError>, Option<&Endpoint>) + Send>;

/// Low-level notification that the transport can accept more data.
pub type ReadyHandler = Box<dyn FnMut() + Send>;

/// Receives each inbound chunk, or the connection-fatal error that closed
/// the socket. The slice holds exactly the bytes read.
pub type RecvHandler = Box<dyn FnMut(Result<&[u8], IoError>) + Send>;

/// Fires once when the bytes of one `send` call have fully left the buffer,
/// carrying that call's byte count, or once with the failure that closed the
/// connection.
pub type SendCompletion = Box<dyn FnOnce(Result<usize, IoError>) + Send>;

/// Options for one TCP connect attempt.
pub struct ConnectOptions {
	host: String,
	port: u16,
	timeout: Duration,
	nodelay: bool,
	tls: bool,
	trust_anchor: Option<Vec<u8>>,
}

impl ConnectOptions {
	pub fn new(host: impl Into<String>, port: u16) -> ConnectOptions {
		ConnectOptions {
			host: host.into(),
			port,
			timeout: Duration::from_secs(5),
			nodelay: false,
			tls: false,
			trust_anchor: None,
		}
	}

	/// Bounds the blocking connect wait.
	pub fn timeout(mut self, timeout: Duration) -> ConnectOptions {
		self.timeout = timeout;
		self
	}

	/// Disables Nagle's algorithm on the new socket.
	pub fn nodelay(mut self, nodelay: bool) -> ConnectOptions {
		self.nodelay = nodelay;
		self
	}

	/// Requests TLS. The optional PEM trust anchor joins the platform roots;
	/// server verification stays on either way.
	pub fn tls(mut self, trust_anchor: Option<Vec<u8>>) -> ConnectOptions {
		self.tls = true;
		self.trust_anchor = trust_anchor;
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
	Idle,
	Connecting,
	TlsHandshaking,
	Established,
	Closed,
}

/// A client TCP connection driven by the shared readiness poll.
///
/// Construction registers the connection with the registry; interest begins
/// only once a connect attempt reaches the TLS handshake or establishes.
/// Dropping the handle is the close path: the registry entry goes stale and
/// is compacted on the next poll.
pub struct Tcp {
	core: Arc<TcpCore>,
}

impl Tcp {
	pub fn new() -> Tcp {
		let core = Arc::new(TcpCore {
			inner: Mutex::new(TcpInner {
				sock: Socket::closed(),
				state: TcpState::Idle,
				peer: None,
				pending: Vec::new(),
				offset: 0,
				completions: VecDeque::new(),
				on_connect: None,
				on_ready: None,
				on_recv: None,
				session: None,
			}),
		});
		poll::register(core.clone());
		Tcp { core }
	}

	/// Starts a connect attempt. See [`ConnectOptions`] for knobs.
	///
	/// Blocks for at most the configured timeout while the TCP handshake
	/// completes. Without TLS the completion fires before this returns; with
	/// TLS it fires from a later poll cycle once the handshake finishes.
	/// Calling this while an attempt is live fails fast with
	/// [`ConnectError::Busy`] and leaves the existing connection untouched.
	pub fn connect(
		&self,
		options: ConnectOptions,
		on_complete: ConnectHandler,
		on_ready: ReadyHandler,
		on_recv: RecvHandler,
	) {
		self.core.connect(options, on_complete, on_ready, on_recv);
	}

	/// Reconnects to an already-resolved endpoint, skipping resolution and
	/// reusing the ready/recv handlers from the previous attempt. Used for
	/// transport redirects. Always plain TCP.
	pub fn connect_endpoint(
		&self,
		peer: Endpoint,
		timeout: Duration,
		on_complete: ConnectHandler,
	) {
		self.core.connect_endpoint(peer, timeout, on_complete);
	}

	/// Appends bytes to the pending send buffer.
	///
	/// Transmission happens on write readiness; completions queue in call
	/// order, each keyed to its byte range. On a closed connection the
	/// completion fires immediately with failure.
	pub fn send(&self, body: &[u8], on_complete: SendCompletion) {
		self.core.send(body, on_complete);
	}

	/// Closes the connection, failing any queued send completions. Safe to
	/// call repeatedly or before any connect.
	pub fn close(&self) {
		self.core.close();
	}

	pub fn established(&self) -> bool {
		self.core.lock().state == TcpState::Established
	}

	/// Remote endpoint of the current or last attempt, if resolution got
	/// that far.
	pub fn peer(&self) -> Option<Endpoint> {
		self.core.lock().peer
	}

	/// Raw handle, for callers wiring this fd into their own bookkeeping.
	pub fn raw_fd(&self) -> Option<RawFd> {
		self.core.lock().sock.raw()
	}
}

impl Default for Tcp {
	fn default() -> Tcp {
		Tcp::new()
	}
}

struct TcpInner {
	sock: Socket,
	state: TcpState,
	peer: Option<Endpoint>,
	pending: Vec<u8>,
	offset: usize,
	// (buffer end offset, range length, completion)
	completions: VecDeque<(usize, usize, SendCompletion)>,
	on_connect: Option<ConnectHandler>,
	on_ready: Option<ReadyHandler>,
	on_recv: Option<RecvHandler>,
	session: Option<ClientConnection>,
}

struct TcpCore {
	inner: Mutex<TcpInner>,
}

impl TcpCore {
	fn lock(&self) -> std::sync::MutexGuard<'_, TcpInner> {
		self.inner.lock().expect("tcp connection state poisoned")
	}

	fn connect(
		&self,
		options: ConnectOptions,
		on_complete: ConnectHandler,
		on_ready: ReadyHandler,
		on_recv: RecvHandler,
	) {
		let mut inner = self.lock();
		if connect_busy(inner.state) {
			drop(inner);
			on_complete(Err(ConnectError::Busy), None);
			return;
		}

		inner.on_ready = Some(on_ready);
		inner.on_recv = Some(on_recv);
		inner.pending.clear();
		inner.offset = 0;
		inner.completions.clear();
		inner.session = None;

		match start_connect(&mut inner, &options) {
			// Established without TLS: complete synchronously.
			Ok(true) => {
				inner.state = TcpState::Established;
				let peer = inner.peer;
				drop(inner);
				on_complete(Ok(()), peer.as_ref());
			}
			// TLS handshake continues under the readiness poll.
			Ok(false) => {
				inner.on_connect = Some(on_complete);
			}
			Err(e) => {
				inner.session = None;
				inner.sock.close();
				inner.state = TcpState::Closed;
				let peer = inner.peer;
				drop(inner);
				on_complete(Err(e), peer.as_ref());
			}
		}
	}

	fn connect_endpoint(&self, peer: Endpoint, timeout: Duration, on_complete: ConnectHandler) {
		let mut inner = self.lock();
		if connect_busy(inner.state) {
			drop(inner);
			on_complete(Err(ConnectError::Busy), None);
			return;
		}

		inner.pending.clear();
		inner.offset = 0;
		inner.completions.clear();
		inner.session = None;
		inner.peer = Some(peer);

		match establish(&mut inner, &peer, timeout) {
			Ok(()) => {
				inner.state = TcpState::Established;
				drop(inner);
				on_complete(Ok(()), Some(&peer));
			}
			Err(e) => {
				inner.sock.close();
				inner.state = TcpState::Closed;
				drop(inner);
				on_complete(Err(e), Some(&peer));
			}
		}
	}

	fn send(&self, body: &[u8], on_complete: SendCompletion) {
		let mut inner = self.lock();
		match inner.state {
			TcpState::Connecting | TcpState::TlsHandshaking | TcpState::Established => {
				inner.pending.extend_from_slice(body);
				let end = inner.pending.len();
				inner.completions.push_back((end, body.len(), on_complete));
			}
			TcpState::Idle | TcpState::Closed => {
				drop(inner);
				on_complete(Err(IoError::Closed));
			}
		}
	}

	fn close(&self) {
		let mut inner = self.lock();
		let completions: Vec<_> = inner.completions.drain(..).collect();
		inner.session = None;
		inner.sock.close();
		inner.state = TcpState::Closed;
		drop(inner);
		for (_, _, cb) in completions {
			cb(Err(IoError::Closed));
		}
	}

	/// TLS handshake as a poll-driven state: feed inbound records, flush
	/// outbound ones, and settle the connect attempt when rustls finishes
	/// (or fails, which covers certificate verification).
	fn drive_handshake(&self, readable: bool, writable: bool, errored: bool) {
		let Ok(mut inner) = self.inner.try_lock() else { return };
		if inner.state != TcpState::TlsHandshaking {
			return;
		}

		let mut failure: Option<TlsError> = None;

		if errored {
			let code = inner.sock.take_error().unwrap_or(0);
			failure = Some(TlsError::Handshake {
				reason: format!("socket error during handshake (errno {})", code),
			});
		}

		{
			let TcpInner { ref mut sock, ref mut session, .. } = *inner;
			let Some(conn) = session.as_mut() else { return };

			if failure.is_none() && readable {
				match conn.read_tls(sock) {
					Ok(0) => {
						failure = Some(TlsError::Handshake {
							reason: "peer closed during handshake".to_string(),
						});
					}
					Ok(_) => {
						if let Err(e) = conn.process_new_packets() {
							failure = Some(TlsError::Handshake { reason: e.to_string() });
						}
					}
					Err(e) if e.kind() == ErrorKind::WouldBlock => {}
					Err(e) => failure = Some(TlsError::Handshake { reason: e.to_string() }),
				}
			}

			if failure.is_none() && (writable || conn.wants_write()) {
				while conn.wants_write() {
					match conn.write_tls(sock) {
						Ok(_) => {}
						Err(e) if e.kind() == ErrorKind::WouldBlock => break,
						Err(e) => {
							failure = Some(TlsError::Handshake { reason: e.to_string() });
							break;
						}
					}
				}
			}
		}

		let outcome = if let Some(e) = failure {
			inner.session = None;
			inner.sock.close();
			inner.state = TcpState::Closed;
			Some(Err(ConnectError::Tls(e)))
		} else if inner.session.as_ref().is_some_and(|c| !c.is_handshaking()) {
			inner.state = TcpState::Established;
			Some(Ok(()))
		} else {
			None
		};

		if let Some(result) = outcome {
			let handler = inner.on_connect.take();
			let peer = inner.peer;
			drop(inner);
			if let Some(h) = handler {
				h(result, peer.as_ref());
			}
		}
	}

	fn handle_recv(&self) {
		let Ok(mut inner) = self.inner.try_lock() else { return };
		if inner.state != TcpState::Established {
			return;
		}

		let mut chunks: Vec<Vec<u8>> = Vec::new();
		let mut fatal: Option<IoError> = None;

		if inner.session.is_some() {
			let TcpInner { ref mut sock, ref mut session, .. } = *inner;
			if let Some(conn) = session.as_mut() {
				match conn.read_tls(sock) {
					Ok(0) => fatal = Some(IoError::Closed),
					Ok(_) => match conn.process_new_packets() {
						Ok(_) => loop {
							let mut buf = vec![0u8; RECV_CHUNK];
							match conn.reader().read(&mut buf) {
								Ok(0) => {
									fatal = Some(IoError::Closed);
									break;
								}
								Ok(n) => {
									buf.truncate(n);
									chunks.push(buf);
								}
								Err(e) if e.kind() == ErrorKind::WouldBlock => break,
								Err(e) => {
									fatal = Some(IoError::Tls { reason: e.to_string() });
									break;
								}
							}
						},
						Err(e) => fatal = Some(IoError::Tls { reason: e.to_string() }),
					},
					Err(e) if e.kind() == ErrorKind::WouldBlock => {}
					Err(e) => {
						fatal = Some(IoError::Recv {
							errno: e.raw_os_error().unwrap_or(0),
						});
					}
				}
			}
		} else {
			let mut buf = vec![0u8; RECV_CHUNK];
			match inner.sock.recv(&mut buf) {
				Ok(0) => fatal = Some(IoError::Closed),
				Ok(n) => {
					buf.truncate(n);
					chunks.push(buf);
				}
				Err(IoError::Recv { errno: e }) if e == libc::EAGAIN || e == libc::EINTR => {}
				Err(e) => fatal = Some(e),
			}
		}

		let on_recv = inner.on_recv.take();
		let mut failed_sends = Vec::new();
		if fatal.is_some() {
			failed_sends = inner.completions.drain(..).collect();
			inner.session = None;
			inner.sock.close();
			inner.state = TcpState::Closed;
		}
		drop(inner);

		if let Some(mut cb) = on_recv {
			for chunk in &chunks {
				cb(Ok(chunk));
			}
			if let Some(e) = fatal {
				cb(Err(e));
			}
			let mut inner = self.lock();
			if inner.on_recv.is_none() {
				inner.on_recv = Some(cb);
			}
		}
		for (_, _, cb) in failed_sends {
			cb(Err(IoError::Closed));
		}
	}

	fn handle_send(&self) {
		// Empty buffer: let the caller feed data opportunistically, then
		// flush whatever the notification queued this same cycle.
		let notify = {
			let Ok(inner) = self.inner.try_lock() else { return };
			inner.state == TcpState::Established
				&& inner.pending.is_empty()
				&& inner.offset == 0
		};
		if notify {
			let cb = self.lock().on_ready.take();
			if let Some(mut cb) = cb {
				cb();
				let mut inner = self.lock();
				if inner.on_ready.is_none() {
					inner.on_ready = Some(cb);
				}
			}
		}

		self.flush_pending();
	}

	fn flush_pending(&self) {
		let Ok(mut inner) = self.inner.try_lock() else { return };
		if inner.state != TcpState::Established || inner.pending.is_empty() {
			return;
		}

		let wrote: Result<usize, IoError> = {
			let TcpInner { ref mut sock, ref mut session, ref pending, offset, .. } = *inner;
			let chunk = &pending[offset..];
			if let Some(conn) = session.as_mut() {
				match conn.writer().write(chunk) {
					Ok(n) => {
						let mut flush_err = None;
						while conn.wants_write() {
							match conn.write_tls(sock) {
								Ok(_) => {}
								Err(e) if e.kind() == ErrorKind::WouldBlock => break,
								Err(e) => {
									flush_err = Some(IoError::Send {
										errno: e.raw_os_error().unwrap_or(0),
									});
									break;
								}
							}
						}
						match flush_err {
							Some(e) => Err(e),
							None => Ok(n),
						}
					}
					Err(e) => Err(IoError::Tls { reason: e.to_string() }),
				}
			} else {
				match sock.send(chunk) {
					Ok(0) => Err(IoError::Closed),
					Ok(n) => Ok(n),
					Err(IoError::Send { errno: e }) if e == libc::EAGAIN || e == libc::EINTR => {
						return;
					}
					Err(e) => Err(e),
				}
			}
		};

		match wrote {
			Ok(n) => {
				inner.offset += n;
				let mut done = Vec::new();
				while let Some((end, _, _)) = inner.completions.front() {
					if *end > inner.offset {
						break;
					}
					if let Some((_, len, cb)) = inner.completions.pop_front() {
						done.push((len, cb));
					}
				}
				if inner.offset == inner.pending.len() {
					inner.pending.clear();
					inner.offset = 0;
				}
				drop(inner);
				for (len, cb) in done {
					cb(Ok(len));
				}
			}
			Err(e) => {
				let failed: Vec<_> = inner.completions.drain(..).collect();
				inner.session = None;
				inner.sock.close();
				inner.state = TcpState::Closed;
				drop(inner);
				let mut first = Some(e);
				for (_, _, cb) in failed {
					match first.take() {
						Some(e) => cb(Err(e)),
						None => cb(Err(IoError::Closed)),
					}
				}
			}
		}
	}

	/// Error-set readiness on a live connection: surface the pending error
	/// through the receive path and close.
	fn fail_connection(&self) {
		let Ok(mut inner) = self.inner.try_lock() else { return };
		if inner.state != TcpState::Established {
			return;
		}
		let code = inner.sock.take_error().unwrap_or(0);
		let on_recv = inner.on_recv.take();
		let failed_sends: Vec<_> = inner.completions.drain(..).collect();
		inner.session = None;
		inner.sock.close();
		inner.state = TcpState::Closed;
		drop(inner);

		if let Some(mut cb) = on_recv {
			if code != 0 {
				cb(Err(IoError::Recv { errno: code }));
			} else {
				cb(Err(IoError::Closed));
			}
		}
		for (_, _, cb) in failed_sends {
			cb(Err(IoError::Closed));
		}
	}
}

impl Pollable for TcpCore {
	fn poll_fd(&self) -> Option<RawFd> {
		let inner = self.inner.try_lock().ok()?;
		match inner.state {
			TcpState::TlsHandshaking | TcpState::Established => inner.sock.raw(),
			_ => None,
		}
	}

	fn on_readiness(&self, readable: bool, writable: bool, errored: bool) {
		let state = {
			let Ok(inner) = self.inner.try_lock() else { return };
			inner.state
		};
		match state {
			TcpState::TlsHandshaking => self.drive_handshake(readable, writable, errored),
			TcpState::Established => {
				if errored {
					self.fail_connection();
					return;
				}
				// Drain inbound before producing more outbound load.
				if readable {
					self.handle_recv();
				}
				if writable {
					self.handle_send();
				}
			}
			_ => {}
		}
	}
}

fn connect_busy(state: TcpState) -> bool {
	matches!(
		state,
		TcpState::Connecting | TcpState::TlsHandshaking | TcpState::Established
	)
}

/// Resolution through TCP establishment. Returns `Ok(true)` when established
/// (no TLS) and `Ok(false)` when the TLS handshake is now pending.
fn start_connect(inner: &mut TcpInner, options: &ConnectOptions) -> Result<bool, ConnectError> {
	inner.peer = None;
	let peer = Endpoint::resolve(&options.host, options.port).map_err(ConnectError::Socket)?;
	info!(host = %options.host, endpoint = %peer, "address resolved");
	inner.peer = Some(peer);

	establish_with_options(inner, &peer, options)?;

	if !options.tls {
		return Ok(true);
	}

	let config = tls::client_config(options.trust_anchor.as_deref())?;
	let name = ServerName::try_from(options.host.clone()).map_err(|_| {
		TlsError::InvalidServerName {
			name: options.host.clone(),
		}
	})?;
	let session = ClientConnection::new(config, name)
		.map_err(|e| TlsError::Session { reason: e.to_string() })?;
	inner.session = Some(session);
	inner.state = TcpState::TlsHandshaking;
	Ok(false)
}

fn establish_with_options(
	inner: &mut TcpInner,
	peer: &Endpoint,
	options: &ConnectOptions,
) -> Result<(), ConnectError> {
	inner.sock.open(libc::SOCK_STREAM).map_err(ConnectError::Socket)?;
	inner.sock.set_nonblocking().map_err(ConnectError::Socket)?;
	if options.nodelay {
		inner.sock.set_nodelay().map_err(ConnectError::Socket)?;
	}
	finish_connect(inner, peer, options.timeout)
}

fn establish(inner: &mut TcpInner, peer: &Endpoint, timeout: Duration) -> Result<(), ConnectError> {
	inner.sock.open(libc::SOCK_STREAM).map_err(ConnectError::Socket)?;
	inner.sock.set_nonblocking().map_err(ConnectError::Socket)?;
	finish_connect(inner, peer, timeout)
}

fn finish_connect(
	inner: &mut TcpInner,
	peer: &Endpoint,
	timeout: Duration,
) -> Result<(), ConnectError> {
	inner.state = TcpState::Connecting;

	if let Err(e) = inner.sock.connect(peer) {
		if e != libc::EINPROGRESS {
			return Err(ConnectError::Connect { errno: e });
		}
	}

	wait_connected(&inner.sock, timeout)?;

	match inner.sock.take_error() {
		Ok(0) => Ok(()),
		Ok(err) => Err(ConnectError::Connect { errno: err }),
		Err(e) => Err(ConnectError::Socket(e)),
	}
}

/// Bounded multiplex wait on the single connecting fd.
///
/// Distinguishes select failure, timeout (zero readiness within the bound),
/// and the degenerate "positive return but nothing signaled" case.
fn wait_connected(sock: &Socket, timeout: Duration) -> Result<(), ConnectError> {
	let Some(fd) = sock.raw() else {
		return Err(ConnectError::Connect { errno: libc::EBADF });
	};

	let mut rset: libc::fd_set = unsafe { std::mem::zeroed() };
	let mut wset: libc::fd_set = unsafe { std::mem::zeroed() };
	let mut eset: libc::fd_set = unsafe { std::mem::zeroed() };
	unsafe {
		libc::FD_ZERO(&mut rset);
		libc::FD_ZERO(&mut wset);
		libc::FD_ZERO(&mut eset);
		libc::FD_SET(fd, &mut rset);
		libc::FD_SET(fd, &mut wset);
		libc::FD_SET(fd, &mut eset);
	}

	let mut tv = libc::timeval {
		tv_sec: timeout.as_secs() as libc::time_t,
		tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
	};
	let rc = unsafe { libc::select(fd + 1, &mut rset, &mut wset, &mut eset, &mut tv) };
	if rc < 0 {
		return Err(ConnectError::SelectFailed { errno: errno() });
	}
	if rc == 0 {
		return Err(ConnectError::TimedOut);
	}

	let readable = unsafe { libc::FD_ISSET(fd, &rset) };
	let writable = unsafe { libc::FD_ISSET(fd, &wset) };
	if !readable && !writable {
		return Err(ConnectError::NoReadiness);
	}
	Ok(())
}
