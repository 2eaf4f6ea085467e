//! Error types for the docwire driver.

use std::time::Duration;

use docwire_wire::WireError;
use thiserror::Error;

use crate::auth::Mechanism;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by connections, the pool, the authenticator and the
/// server façade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Socket-level failure. The owning connection is torn down and replaced.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or out-of-order handshake step. Fatal for the
    /// connection it occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the credential.
    #[error("authentication failed ({mechanism}): {message}")]
    AuthenticationFailed { mechanism: Mechanism, message: String },

    /// The server's final signature did not match the locally computed one.
    #[error("server signature mismatch ({mechanism}): possible impersonation")]
    ServerSignatureMismatch { mechanism: Mechanism },

    /// No connection became available within the checkout timeout.
    #[error("connection pool exhausted for {address} (timeout: {timeout:?})")]
    PoolExhausted { address: String, timeout: Duration },

    /// The connection closed while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The pool has been destroyed.
    #[error("connection pool destroyed")]
    PoolDestroyed,

    /// The server answered a command with `ok: 0`.
    #[error("command failed ({code} {code_name}): {message}")]
    Command {
        code: i64,
        code_name: String,
        message: String,
    },

    /// The encoding collaborator failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid options or configuration file.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Errors after which a fresh checkout may succeed.
    pub fn is_retryable_checkout(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(_) | DriverError::ConnectionClosed | DriverError::PoolExhausted { .. }
        )
    }

    /// Credential or trust failures, which are never retried automatically.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DriverError::AuthenticationFailed { .. } | DriverError::ServerSignatureMismatch { .. }
        )
    }

    /// Errors that leave the connection they occurred on unusable.
    pub(crate) fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(_)
                | DriverError::Protocol(_)
                | DriverError::ConnectionClosed
                | DriverError::ServerSignatureMismatch { .. }
        )
    }
}

impl From<WireError> for DriverError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Codec(msg) => DriverError::Codec(msg),
            WireError::Io(msg) => DriverError::Transport(msg),
            other => DriverError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}
