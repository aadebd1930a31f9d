//! Crate-level error type.

use std::{fmt, io};

use crate::packet;

/// Errors surfaced by the responder, querier, and zone construction.
///
/// Per-datagram problems (malformed packets, send failures on a healthy socket) are logged and
/// swallowed where they occur; this type covers the errors that are reported to callers.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The OS rejected a socket bind or socket option.
    Bind(io::Error),
    /// Joining the mDNS multicast group failed.
    Join(io::Error),
    /// Sending a datagram failed on every usable socket.
    Send(io::Error),
    /// Receiving a datagram failed.
    Recv(io::Error),
    /// A service definition was invalid (bad FQDN, port 0, empty instance, unresolvable host).
    InvalidArgument(String),
    /// The responder is already running.
    AlreadyRunning,
    /// The responder is not running.
    NotRunning,
    /// Neither an IPv4 nor an IPv6 socket could be set up.
    NoSocket,
    /// The operation was attempted on a closed query stream.
    Closed,
    /// A message could not be encoded or decoded.
    Packet(packet::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bind(e) => write!(f, "failed to bind socket: {}", e),
            Error::Join(e) => write!(f, "failed to join multicast group: {}", e),
            Error::Send(e) => write!(f, "failed to send datagram: {}", e),
            Error::Recv(e) => write!(f, "failed to receive datagram: {}", e),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::AlreadyRunning => f.write_str("responder is already running"),
            Error::NotRunning => f.write_str("responder is not running"),
            Error::NoSocket => f.write_str("no usable IPv4 or IPv6 socket"),
            Error::Closed => f.write_str("query stream is closed"),
            Error::Packet(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind(e) | Error::Join(e) | Error::Send(e) | Error::Recv(e) => Some(e),
            Error::Packet(e) => Some(e),
            _ => None,
        }
    }
}

impl From<packet::Error> for Error {
    fn from(e: packet::Error) -> Self {
        Error::Packet(e)
    }
}
