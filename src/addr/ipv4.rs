use std::ffi::{CStr, CString};

use crate::error::SocketError;

/// A resolved IPv4 endpoint (address + port).
///
/// Created by [`Endpoint::resolve`]; immutable once resolved. Kept by each
/// socket so the remote address can be reported even on a failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
	ip: [u8; 4],
	port: u16,
}

impl Endpoint {
	/// Resolves a dotted-decimal literal or hostname to an IPv4 endpoint.
	///
	/// Goes through `getaddrinfo` with an AF_INET hint, so literals short
	/// circuit and hostnames hit the system resolver. Failure carries the
	/// gai error code and its human-readable message.
	pub fn resolve(host_or_ip: &str, port: u16) -> Result<Endpoint, SocketError> {
		let c_host = CString::new(host_or_ip).map_err(|_| SocketError::Resolve {
			code: libc::EAI_NONAME,
			host: host_or_ip.to_string(),
			detail: "embedded nul in host".to_string(),
		})?;

		let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
		hints.ai_family = libc::AF_INET;

		let mut res: *mut libc::addrinfo = std::ptr::null_mut();
		let rc = unsafe {
			libc::getaddrinfo(c_host.as_ptr(), std::ptr::null(), &hints, &mut res)
		};
		if rc != 0 {
			let detail = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
				.to_string_lossy()
				.into_owned();
			return Err(SocketError::Resolve {
				code: rc,
				host: host_or_ip.to_string(),
				detail,
			});
		}

		let mut ip = None;
		let mut cur = res;
		while !cur.is_null() {
			let ai = unsafe { &*cur };
			if ai.ai_family == libc::AF_INET && !ai.ai_addr.is_null() {
				let sin = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in) };
				ip = Some(sin.sin_addr.s_addr.to_ne_bytes());
				break;
			}
			cur = ai.ai_next;
		}
		unsafe { libc::freeaddrinfo(res) };

		match ip {
			Some(ip) => Ok(Endpoint { ip, port }),
			None => Err(SocketError::Resolve {
				code: libc::EAI_NONAME,
				host: host_or_ip.to_string(),
				detail: "no ipv4 address for host".to_string(),
			}),
		}
	}

	/// Creates an endpoint from already-known address bytes and port.
	pub fn new(ip: [u8; 4], port: u16) -> Endpoint {
		Endpoint { ip, port }
	}

	/// Returns the address bytes in dotted order.
	pub fn ip(&self) -> [u8; 4] {
		self.ip
	}

	/// Returns the port.
	pub fn port(&self) -> u16 {
		self.port
	}

	/// Converts to the raw sockaddr_in for syscalls.
	pub(crate) fn to_raw(&self) -> libc::sockaddr_in {
		libc::sockaddr_in {
			sin_family: libc::AF_INET as libc::sa_family_t,
			sin_port: self.port.to_be(),
			sin_addr: libc::in_addr {
				s_addr: u32::from_ne_bytes(self.ip),
			},
			sin_zero: [0; 8],
		}
	}

	/// Creates from a raw sockaddr_in (e.g. a recvfrom source address).
	pub(crate) fn from_raw(raw: &libc::sockaddr_in) -> Endpoint {
		Endpoint {
			ip: raw.sin_addr.s_addr.to_ne_bytes(),
			port: u16::from_be(raw.sin_port),
		}
	}
}

impl std::fmt::Display for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}.{}.{}.{}:{}",
			self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port
		)
	}
}
