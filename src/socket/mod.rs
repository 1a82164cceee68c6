//! Socket layer: the fd-owning base, the poll-driven TCP connection, and
//! the connectionless UDP endpoint.

pub(crate) mod base;
mod tcp;
mod udp;

pub use self::tcp::{
	ConnectHandler, ConnectOptions, ReadyHandler, RecvHandler, SendCompletion, Tcp,
};
pub use self::udp::{InitHandler, Udp, UdpRecvHandler};

/// Receive chunk size for both TCP and UDP reads.
pub const RECV_CHUNK: usize = 64 * 1024;
