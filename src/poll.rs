//! Process-wide readiness registry.
//!
//! Holds weak references to every live socket and runs one multiplexed,
//! zero-timeout `select` per [`poll_once`] call. Registration never extends a
//! socket's lifetime: dead entries are compacted away on each poll.

use std::os::fd::RawFd;
use std::sync::{Arc, LazyLock, Mutex, Weak};

/// A socket that can take part in the shared readiness poll.
///
/// Implementations must never block in these methods; a socket whose state
/// lock is held elsewhere simply sits out the current cycle.
pub(crate) trait Pollable: Send + Sync {
	/// Returns the fd to watch this cycle, or `None` to sit out.
	fn poll_fd(&self) -> Option<RawFd>;

	/// Dispatches the readiness outcome for this cycle.
	fn on_readiness(&self, readable: bool, writable: bool, errored: bool);
}

static REGISTRY: LazyLock<Mutex<Vec<Weak<dyn Pollable>>>> =
	LazyLock::new(|| Mutex::new(Vec::new()));

/// Adds a socket to the registry. Duplicate registration is harmless.
pub(crate) fn register(socket: Arc<dyn Pollable>) {
	let mut entries = REGISTRY.lock().expect("readiness registry poisoned");
	entries.push(Arc::downgrade(&socket));
}

/// Resolves every weak entry, replacing the stored set with the live ones.
///
/// This is the compaction point: entries whose socket has been destroyed
/// vanish here, so a poll can never dispatch to a dead socket.
fn live_sockets() -> Vec<Arc<dyn Pollable>> {
	let mut entries = REGISTRY.lock().expect("readiness registry poisoned");
	let mut live = Vec::with_capacity(entries.len());
	let mut kept = Vec::with_capacity(entries.len());
	for entry in entries.iter() {
		if let Some(socket) = entry.upgrade() {
			live.push(socket);
			kept.push(entry.clone());
		}
	}
	*entries = kept;
	live
}

/// Runs one non-blocking readiness cycle over every interested socket.
///
/// Returns `true` if at least one socket participated, whether or not any
/// descriptor was actually ready, so a driving loop can tell "nothing to do"
/// from "did work". Never blocks: the select timeout is zero.
pub fn poll_once() -> bool {
	let sockets = live_sockets();
	if sockets.is_empty() {
		return false;
	}

	let mut participants: Vec<(Arc<dyn Pollable>, RawFd)> = Vec::with_capacity(sockets.len());
	let mut max_fd: RawFd = -1;

	let mut rset: libc::fd_set = unsafe { std::mem::zeroed() };
	let mut wset: libc::fd_set = unsafe { std::mem::zeroed() };
	let mut eset: libc::fd_set = unsafe { std::mem::zeroed() };
	unsafe {
		libc::FD_ZERO(&mut rset);
		libc::FD_ZERO(&mut wset);
		libc::FD_ZERO(&mut eset);
	}

	for socket in sockets {
		if let Some(fd) = socket.poll_fd() {
			if fd < 0 || fd as usize >= libc::FD_SETSIZE {
				continue;
			}
			unsafe {
				libc::FD_SET(fd, &mut rset);
				libc::FD_SET(fd, &mut wset);
				libc::FD_SET(fd, &mut eset);
			}
			if fd > max_fd {
				max_fd = fd;
			}
			participants.push((socket, fd));
		}
	}

	if participants.is_empty() {
		return false;
	}

	let mut timeout = libc::timeval { tv_sec: 0, tv_usec: 0 };
	let rc = unsafe {
		libc::select(max_fd + 1, &mut rset, &mut wset, &mut eset, &mut timeout)
	};
	if rc > 0 {
		for (socket, fd) in &participants {
			let readable = unsafe { libc::FD_ISSET(*fd, &rset) };
			let writable = unsafe { libc::FD_ISSET(*fd, &wset) };
			let errored = unsafe { libc::FD_ISSET(*fd, &eset) };
			if readable || writable || errored {
				socket.on_readiness(readable, writable, errored);
			}
		}
	}

	true
}
