//! Crate-wide error type.
//!
//! Library operations surface a small closed set of failure kinds; callers in
//! `main.rs` render them directly. Transport-level errors carry their
//! underlying `io::Error` as the source so the OS detail is not lost.

use std::io;

/// Failure kinds surfaced by the public API.
#[derive(Debug)]
pub enum Error {
    /// Malformed user input: bad hex ID, wrong-size ID bytes, malformed
    /// `ip:port`, or a reserved port (≤ 1023).
    InvalidInput(String),
    /// A lookup was initiated with no peers in the routing table.
    RoutingEmpty,
    /// Socket creation, bind, send, or receive failed.
    Transport(io::Error),
    /// No STUN server produced a parseable response within the timeout.
    StunFailure,
    /// All hole-punching strategies were exhausted without a connection.
    HolePunchFailure,
    /// A value lookup completed without discovering the value.
    NotFound,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::RoutingEmpty => write!(f, "routing table is empty"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::StunFailure => write!(f, "no STUN server produced a usable response"),
            Error::HolePunchFailure => write!(f, "all hole-punching strategies failed"),
            Error::NotFound => write!(f, "value not found"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_preserves_source() {
        let err = Error::from(io::Error::new(io::ErrorKind::AddrInUse, "taken"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("taken"));
    }
}
