//! Error types for the server stack

use std::io;

use thiserror::Error;

/// Errors produced by the listener and per-connection machinery.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No listening socket could be bound.
    #[error("could not bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// The host key could not be loaded or generated.
    #[error("host key error: {0}")]
    HostKey(String),

    /// The client failed authentication, or disconnected before
    /// completing it.
    #[error("client authentication did not complete")]
    AuthenticationIncomplete,

    /// Operation on a handler or session that has already shut down.
    #[error("connection closed")]
    Closed,

    /// Transport-level protocol failure.
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Plain I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for server stack operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let err = ServerError::Bind {
            addr: "[::]:830".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let text = err.to_string();
        assert!(text.contains("[::]:830"));
        assert!(text.contains("in use"));
    }
}
