//! Resolved network addresses.
//!
//! The socket layer deals only in IPv4 endpoints: a hostname-or-literal
//! string is resolved once, and the resulting `Endpoint` is immutable for
//! the life of the socket that resolved it.

mod ipv4;

pub use self::ipv4::Endpoint;
