//! Error taxonomy for connection dispatch.
//!
//! Errors here are always local to one connection. Pool-level exhaustion is
//! reported through `TaskRejected`, never by blocking the submitting thread.

use std::fmt;

/// Boxed error type returned by handler bodies.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure modes of a single connection's request/response cycle.
#[derive(Debug)]
pub enum DispatchError {
    /// Malformed request line, header, or body framing. Answered with a
    /// protocol-error response when the connection state still permits one.
    Protocol(String),
    /// TLS or upgrade negotiation failed. The connection is closed without
    /// a handler ever running.
    Handshake(String),
    /// The blocking-task backlog limit was exceeded. Answered with an
    /// overload response from the I/O thread.
    TaskRejected,
    /// The handler body returned an error. Mapped to a server-error response
    /// if no bytes were written yet, else the connection is aborted.
    Handler(HandlerError),
}

impl DispatchError {
    /// Status code to answer with, if the connection can still carry one.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::Protocol(_) => 400,
            DispatchError::Handshake(_) => 400,
            DispatchError::TaskRejected => 503,
            DispatchError::Handler(_) => 500,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Protocol(reason) => write!(f, "protocol error: {reason}"),
            DispatchError::Handshake(reason) => write!(f, "handshake failure: {reason}"),
            DispatchError::TaskRejected => write!(f, "blocking task rejected: backlog full"),
            DispatchError::Handler(e) => write!(f, "handler failure: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(DispatchError::Protocol("bad request line".into()).status(), 400);
        assert_eq!(DispatchError::TaskRejected.status(), 503);
        let e = DispatchError::Handler("boom".into());
        assert_eq!(e.status(), 500);
    }
}
