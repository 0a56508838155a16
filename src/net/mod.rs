//! TCP socket engine
//!
//! This module implements the connection core, the TLS layer and the
//! multi-threaded server multiplexer. All blocking is done through bounded
//! readiness waits (`poll(2)`); raw send/receive calls are always preceded
//! by a readiness confirmation.
//!
//! # Architecture
//!
//! - [`fd`] owns descriptor lifetimes: every raw OS socket lives inside an
//!   [`FdHandle`] allocated by the [`FdManager`], which also tracks the TLS
//!   session attached to it. Handles are shut down exactly once and are
//!   never touched after invalidation.
//! - [`connection::TcpConnection`] is one TCP endpoint (outbound client or
//!   accepted peer) with timeout-governed read/write operations.
//! - [`tls`] builds credential sets from certificate bundles and drives the
//!   handshake for both roles, including SNI-based bundle selection on the
//!   server side.
//! - [`server::TcpServer`] accepts peers on worker threads and delivers
//!   received bytes through callbacks.

pub mod connection;
pub mod fd;
pub mod server;
pub mod tls;

pub use connection::{TcpConnection, TcpConnectionBuilder};
pub use fd::{FdHandle, FdManager, Transport};
pub use server::{ConnectionId, TcpServer, TcpServerBuilder};
pub use tls::{CertificateBundle, PemSource};

/// Result type for socket operations
pub type Result<T> = std::result::Result<T, SocketError>;

/// Distinguishes a timeout of the readiness wait from a timeout reported by
/// the read/write call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No readiness within the configured window
    Wait,
    /// The I/O call itself timed out (e.g. `ETIMEDOUT`)
    Io,
}

/// Socket operation errors
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("{message}")]
    Timeout { message: String, kind: TimeoutKind },

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("data limit exceeded: {0}")]
    DataLimit(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("socket operation failed: {0}")]
    Operation(String),
}

impl SocketError {
    pub(crate) fn wait_timeout(message: impl Into<String>) -> Self {
        SocketError::Timeout {
            message: message.into(),
            kind: TimeoutKind::Wait,
        }
    }

    pub(crate) fn io_timeout(message: impl Into<String>) -> Self {
        SocketError::Timeout {
            message: message.into(),
            kind: TimeoutKind::Io,
        }
    }

    /// Timeout sub-kind, if this is a timeout error
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            SocketError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<openssl::error::ErrorStack> for SocketError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SocketError::Tls(e.to_string())
    }
}

/// Largest payload accepted by a single write call
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Listen backlog for server sockets
pub const LISTEN_BACKLOG: i32 = 100;

/// Default read/write timeout unless overridden
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Backoff between connect attempts
pub(crate) const CONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(200);
