//! Errors surfaced by the balancing and dispatch core.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// No connection can be obtained and waiting can't help.
    #[error("server is too busy: {0}")]
    Busy(String),

    /// The dispatch queue hit its soft cap.
    #[error("too many queued commands for \"{0}\"")]
    QueueFull(String),

    /// The bounded wait for an idle connection expired.
    #[error("operation timed out")]
    Timeout,

    /// The caller's own cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend refused the connection with "too many connections".
    /// Transient and handled locally, see `Pool::acquire`.
    #[error("server reported too many connections")]
    ServerOverloaded,

    /// Opening a physical connection failed.
    #[error("connection error: {0}")]
    Connect(String),

    /// The component has been disposed.
    #[error("offline")]
    Offline,

    /// The backend returned something other than what the
    /// introspection queries expect.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Errors a caller may retry against another node.
    pub fn transient(&self) -> bool {
        matches!(self, Error::ServerOverloaded | Error::Timeout)
    }
}
