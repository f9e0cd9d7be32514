//! # Hawser
//!
//! Pooled SSH connection substrate for remote execution and administration.
//!
//! Hawser amortizes expensive handshake and authentication work by caching
//! authenticated transport handles across many short-lived operations, and
//! exposes channels over those handles as plain byte-stream sessions.

#![warn(missing_docs)]

/// Credentials and user SSH configuration lookup
pub mod config;

/// Raw socket resolution and proxy-command transports
pub mod socket;

/// Transport establishment and authentication
pub mod transport;

/// Connection caching, pooled and direct
pub mod cache;

/// Connection and session abstractions
pub mod session;

/// Command execution helpers
pub mod command;

/// Error types
pub mod error;

pub use cache::{CacheStats, ConnectionCache, DirectCache, HandleCache};
pub use command::{shell_escape_single_quote, Host, LocalCommand, RemoteCommand};
pub use config::{Credentials, HostConfig, UserSshConfig};
pub use error::{Error, Result};
pub use session::{CommandSession, Connection, SubsystemSession, MAX_SSH_BUF};
pub use socket::{open_socket, SocketStream};
pub use transport::{open_transport, TransportHandle};
