use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::addr::Endpoint;
use crate::error::{IoError, SocketError, errno};

/// Owner of one OS socket handle.
///
/// `None` is the "no socket" sentinel: the state before `open` and after
/// `close`. Closing is idempotent, and dropping closes through `OwnedFd`, so
/// a never-opened or already-closed socket is always safe to destroy.
pub(crate) struct Socket {
	fd: Option<OwnedFd>,
}

impl Socket {
	pub fn closed() -> Socket {
		Socket { fd: None }
	}

	/// Opens a socket of the given type (SOCK_STREAM or SOCK_DGRAM).
	///
	/// Any previously held handle is released first.
	pub fn open(&mut self, socktype: libc::c_int) -> Result<(), SocketError> {
		self.close();

		let fd = unsafe { libc::socket(libc::AF_INET, socktype | libc::SOCK_CLOEXEC, 0) };
		if fd == -1 {
			return Err(SocketError::Create { errno: errno() });
		}
		self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
		Ok(())
	}

	/// Returns the raw handle, or `None` when closed.
	#[inline]
	pub fn raw(&self) -> Option<RawFd> {
		self.fd.as_ref().map(|fd| fd.as_raw_fd())
	}

	/// Releases the handle. Safe to call repeatedly or on a closed socket.
	pub fn close(&mut self) {
		if let Some(fd) = self.fd.take() {
			debug!(fd = fd.as_raw_fd(), "socket closed");
		}
	}

	/// Sets the socket to non-blocking mode.
	pub fn set_nonblocking(&self) -> Result<(), SocketError> {
		let fd = self.require()?;
		let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
		if flags == -1 {
			return Err(SocketError::GetOption { errno: errno(), option: "F_GETFL" });
		}
		let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
		if rc == -1 {
			return Err(SocketError::SetOption { errno: errno(), option: "O_NONBLOCK" });
		}
		Ok(())
	}

	/// Sets TCP_NODELAY, disabling Nagle's algorithm.
	pub fn set_nodelay(&self) -> Result<(), SocketError> {
		let fd = self.require()?;
		let val: libc::c_int = 1;
		let rc = unsafe {
			libc::setsockopt(
				fd,
				libc::IPPROTO_TCP,
				libc::TCP_NODELAY,
				&val as *const _ as *const libc::c_void,
				std::mem::size_of::<libc::c_int>() as libc::socklen_t,
			)
		};
		if rc == -1 {
			return Err(SocketError::SetOption { errno: errno(), option: "TCP_NODELAY" });
		}
		Ok(())
	}

	/// Reads and clears the pending error (SO_ERROR).
	///
	/// Zero means the preceding asynchronous operation succeeded; nonzero is
	/// the errno it failed with.
	pub fn take_error(&self) -> Result<i32, SocketError> {
		let fd = self.require()?;
		let mut err: libc::c_int = 0;
		let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
		let rc = unsafe {
			libc::getsockopt(
				fd,
				libc::SOL_SOCKET,
				libc::SO_ERROR,
				&mut err as *mut _ as *mut libc::c_void,
				&mut len,
			)
		};
		if rc == -1 {
			return Err(SocketError::GetOption { errno: errno(), option: "SO_ERROR" });
		}
		Ok(err)
	}

	/// Issues connect toward the endpoint. `Err` carries errno; the caller
	/// decides whether EINPROGRESS counts as progress.
	pub fn connect(&self, peer: &Endpoint) -> Result<(), i32> {
		let fd = self.require().map_err(|e| e.code())?;
		let sin = peer.to_raw();
		let rc = unsafe {
			libc::connect(
				fd,
				&sin as *const _ as *const libc::sockaddr,
				std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
			)
		};
		if rc < 0 { Err(errno()) } else { Ok(()) }
	}

	pub fn send(&self, buf: &[u8]) -> Result<usize, IoError> {
		let fd = self.require().map_err(|e| IoError::Send { errno: e.code() })?;
		let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
		if n < 0 {
			Err(IoError::Send { errno: errno() })
		} else {
			Ok(n as usize)
		}
	}

	pub fn recv(&self, buf: &mut [u8]) -> Result<usize, IoError> {
		let fd = self.require().map_err(|e| IoError::Recv { errno: e.code() })?;
		let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
		if n < 0 {
			Err(IoError::Recv { errno: errno() })
		} else {
			Ok(n as usize)
		}
	}

	pub fn send_to(&self, buf: &[u8], peer: &Endpoint) -> Result<usize, IoError> {
		let fd = self.require().map_err(|e| IoError::Send { errno: e.code() })?;
		let sin = peer.to_raw();
		let n = unsafe {
			libc::sendto(
				fd,
				buf.as_ptr() as *const libc::c_void,
				buf.len(),
				0,
				&sin as *const _ as *const libc::sockaddr,
				std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
			)
		};
		if n < 0 {
			Err(IoError::Send { errno: errno() })
		} else {
			Ok(n as usize)
		}
	}

	/// Receives one datagram, returning the byte count and sender address.
	pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Endpoint), IoError> {
		let fd = self.require().map_err(|e| IoError::Recv { errno: e.code() })?;
		let mut src: libc::sockaddr_in = unsafe { std::mem::zeroed() };
		let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
		let n = unsafe {
			libc::recvfrom(
				fd,
				buf.as_mut_ptr() as *mut libc::c_void,
				buf.len(),
				0,
				&mut src as *mut _ as *mut libc::sockaddr,
				&mut len,
			)
		};
		if n < 0 {
			Err(IoError::Recv { errno: errno() })
		} else {
			Ok((n as usize, Endpoint::from_raw(&src)))
		}
	}

	fn require(&self) -> Result<RawFd, SocketError> {
		self.raw().ok_or(SocketError::GetOption { errno: libc::EBADF, option: "fd" })
	}
}

// rustls drives the handshake and record layer through these; EAGAIN comes
// back as ErrorKind::WouldBlock via from_raw_os_error.
impl std::io::Read for Socket {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		let Some(fd) = self.raw() else {
			return Err(std::io::Error::from_raw_os_error(libc::EBADF));
		};
		let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
		if n < 0 {
			Err(std::io::Error::from_raw_os_error(errno()))
		} else {
			Ok(n as usize)
		}
	}
}

impl std::io::Write for Socket {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let Some(fd) = self.raw() else {
			return Err(std::io::Error::from_raw_os_error(libc::EBADF));
		};
		let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
		if n < 0 {
			Err(std::io::Error::from_raw_os_error(errno()))
		} else {
			Ok(n as usize)
		}
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}
