pub mod socket;
mod addr;
mod error;
mod http;
mod poll;
mod tls;

pub use self::addr::Endpoint;
pub use self::error::{ConnectError, HttpError, IoError, SocketError, TlsError, errno};
pub use self::http::{HttpClient, HttpCompletionHandler, HttpErrorHandler, USER_AGENT};
pub use self::poll::poll_once;
pub use self::socket::{
	ConnectHandler, ConnectOptions, InitHandler, RECV_CHUNK, ReadyHandler, RecvHandler,
	SendCompletion, Tcp, Udp, UdpRecvHandler,
};
