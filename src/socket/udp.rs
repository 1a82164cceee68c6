use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::addr::Endpoint;
use crate::error::{IoError, SocketError};
use crate::poll::{self, Pollable};
use crate::socket::RECV_CHUNK;
use crate::socket::base::Socket;
use crate::socket::tcp::{ReadyHandler, SendCompletion};

/// Receives each inbound datagram together with its sender's address, or
/// the error that closed the socket. Sender address travels per datagram;
/// it is not a mutable field on the socket.
pub type UdpRecvHandler = Box<dyn FnMut(Result<(&[u8], Endpoint), IoError>) + Send>;

/// Fires synchronously from [`Udp::new`] with the setup outcome.
pub type InitHandler = Box<dyn FnOnce(Result<(), SocketError>) + Send>;

/// A connectionless UDP endpoint.
///
/// There is no connect phase: resolve, open, done. The endpoint is always
/// interested in readiness while its socket is open. A send or receive
/// failure closes the socket; the object stays around and the caller builds
/// a replacement.
pub struct Udp {
	core: Arc<UdpCore>,
}

impl Udp {
	/// Resolves the target and opens a non-blocking datagram socket. The
	/// init callback fires before this returns, carrying any setup failure;
	/// on failure the returned endpoint holds no socket.
	pub fn new(
		host_or_ip: &str,
		port: u16,
		on_init: InitHandler,
		on_ready: ReadyHandler,
		on_recv: UdpRecvHandler,
	) -> Udp {
		let mut inner = UdpInner {
			sock: Socket::closed(),
			peer: None,
			on_ready: Some(on_ready),
			on_recv: Some(on_recv),
		};

		let setup = setup(&mut inner, host_or_ip, port);
		if setup.is_err() {
			inner.sock.close();
		}
		on_init(setup);

		let core = Arc::new(UdpCore { inner: Mutex::new(inner) });
		poll::register(core.clone());
		Udp { core }
	}

	/// Sends one datagram to the resolved endpoint.
	///
	/// No buffering: the datagram either leaves whole or the send fails,
	/// closing the socket. The completion fires before this returns.
	pub fn send(&self, body: &[u8], on_complete: SendCompletion) {
		self.core.send(body, on_complete);
	}

	/// The resolved target endpoint, when setup got that far.
	pub fn endpoint(&self) -> Option<Endpoint> {
		self.core.lock().peer
	}

	pub fn raw_fd(&self) -> Option<RawFd> {
		self.core.lock().sock.raw()
	}
}

struct UdpInner {
	sock: Socket,
	peer: Option<Endpoint>,
	on_ready: Option<ReadyHandler>,
	on_recv: Option<UdpRecvHandler>,
}

struct UdpCore {
	inner: Mutex<UdpInner>,
}

impl UdpCore {
	fn lock(&self) -> std::sync::MutexGuard<'_, UdpInner> {
		self.inner.lock().expect("udp endpoint state poisoned")
	}

	fn send(&self, body: &[u8], on_complete: SendCompletion) {
		let mut inner = self.lock();
		let Some(peer) = inner.peer else {
			drop(inner);
			on_complete(Err(IoError::Closed));
			return;
		};
		match inner.sock.send_to(body, &peer) {
			Ok(n) => {
				drop(inner);
				on_complete(Ok(n));
			}
			Err(e) => {
				inner.sock.close();
				drop(inner);
				on_complete(Err(e));
			}
		}
	}

	fn handle_recv(&self) {
		let Ok(mut inner) = self.inner.try_lock() else { return };

		let mut buf = vec![0u8; RECV_CHUNK];
		let outcome = inner.sock.recv_from(&mut buf);
		// select can wake without a deliverable datagram (e.g. one dropped
		// for a bad checksum); that is not a socket failure.
		if let Err(IoError::Recv { errno }) = outcome {
			if errno == libc::EAGAIN || errno == libc::EINTR {
				return;
			}
		}
		if outcome.is_err() {
			inner.sock.close();
		}
		// The handler is borrowed out of the lock so it may re-enter send.
		let on_recv = inner.on_recv.take();
		drop(inner);

		if let Some(mut cb) = on_recv {
			match outcome {
				Ok((n, from)) => cb(Ok((&buf[..n], from))),
				Err(e) => cb(Err(e)),
			}
			let mut inner = self.lock();
			if inner.on_recv.is_none() {
				inner.on_recv = Some(cb);
			}
		}
	}

	fn handle_send_ready(&self) {
		let on_ready = {
			let Ok(mut inner) = self.inner.try_lock() else { return };
			inner.on_ready.take()
		};
		if let Some(mut cb) = on_ready {
			cb();
			let mut inner = self.lock();
			if inner.on_ready.is_none() {
				inner.on_ready = Some(cb);
			}
		}
	}
}

impl Pollable for UdpCore {
	fn poll_fd(&self) -> Option<RawFd> {
		self.inner.try_lock().ok()?.sock.raw()
	}

	fn on_readiness(&self, readable: bool, writable: bool, _errored: bool) {
		if readable {
			self.handle_recv();
		}
		if writable {
			self.handle_send_ready();
		}
	}
}

fn setup(inner: &mut UdpInner, host_or_ip: &str, port: u16) -> Result<(), SocketError> {
	let peer = Endpoint::resolve(host_or_ip, port)?;
	info!(host = %host_or_ip, endpoint = %peer, "address resolved");
	inner.peer = Some(peer);

	inner.sock.open(libc::SOCK_DGRAM)?;
	inner.sock.set_nonblocking()?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	// A readable wakeup with nothing deliverable (recvfrom EAGAIN) must
	// leave the socket open and the recv callback uninvoked.
	#[test]
	fn empty_recv_wakeup_does_not_close_the_socket() {
		let invoked = Arc::new(AtomicBool::new(false));
		let flag = invoked.clone();
		let udp = Udp::new(
			"127.0.0.1",
			9,
			Box::new(|result| result.unwrap()),
			Box::new(|| {}),
			Box::new(move |_| flag.store(true, Ordering::SeqCst)),
		);
		assert!(udp.raw_fd().is_some());

		udp.core.handle_recv();

		assert!(udp.raw_fd().is_some());
		assert!(!invoked.load(Ordering::SeqCst));
	}
}
