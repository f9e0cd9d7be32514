//! Error types for the client substrate

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by socket resolution, transport establishment, the
/// connection cache and command execution.
#[derive(Debug, Error)]
pub enum Error {
    /// No address resolved, or every connect attempt failed. Carries the
    /// last error seen while exhausting the resolved candidates.
    #[error("could not connect to {host}:{port}: {source}")]
    Resolution {
        /// Target host as given by the caller.
        host: String,
        /// Target port.
        port: u16,
        /// Last connect or resolution error.
        #[source]
        source: io::Error,
    },

    /// Every credential form (password, private key, agent keys) was
    /// exhausted without the server accepting one.
    #[error("authentication failed for {username}: {reason}")]
    Authentication {
        /// Username the authentication was attempted for.
        username: String,
        /// Short description of the final failure.
        reason: String,
    },

    /// A handle was released that this cache never issued or has already
    /// evicted. This is a caller bug, not a transport condition.
    #[error("handle {0} is not tracked by this cache")]
    CacheConsistency(Uuid),

    /// A remote command exited with a non-zero status.
    #[error("command '{command}' returned non-zero exit status {status}")]
    CommandFailed {
        /// Exit status reported by the remote side.
        status: i32,
        /// The command string that was executed.
        command: String,
        /// Captured stderr, or stdout when stderr was empty.
        output: String,
    },

    /// A channel operation was attempted on a closed connection.
    #[error("channel error: {0}")]
    Channel(String),

    /// The local key agent was unreachable or rejected a request.
    #[error("SSH agent error: {0}")]
    Agent(String),

    /// A private key could not be loaded or decoded.
    #[error("key error: {0}")]
    Key(#[from] russh::keys::Error),

    /// Transport-level protocol failure.
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Plain I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for client substrate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_display_names_target() {
        let err = Error::Resolution {
            host: "example.net".to_string(),
            port: 2022,
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        let text = err.to_string();
        assert!(text.contains("example.net:2022"));
        assert!(text.contains("refused"));
    }

    #[test]
    fn test_command_failed_display() {
        let err = Error::CommandFailed {
            status: 2,
            command: "grep foo missing".to_string(),
            output: "grep: missing: No such file or directory".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("grep foo missing"));
        assert!(text.contains("exit status 2"));
    }

    #[test]
    fn test_cache_consistency_carries_handle_id() {
        let id = Uuid::new_v4();
        let err = Error::CacheConsistency(id);
        assert!(err.to_string().contains(&id.to_string()));
    }
}
