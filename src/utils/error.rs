use crate::pool::{AuthChallenge, CertRequestInfo};
use std::io;
use thiserror::Error;

/// Errors surfaced by the pool, its connect jobs and its configuration.
///
/// Cloneable so that a single failure (a flush, a network change) can be
/// fanned out to every waiting request.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("Connection failed ({kind:?}): {message}")]
    ConnectionFailed { kind: io::ErrorKind, message: String },

    #[error("Certificate error for {}", .0.host_port)]
    CertificateError(CertRequestInfo),

    #[error("Proxy authentication requested by {}", .0.proxy)]
    AuthRequested(AuthChallenge),

    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Socket not connected")]
    NotConnected,

    #[error("Network changed")]
    NetworkChanged,

    #[error("Request aborted")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Build a `ConnectionFailed` from a free-form reason.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            kind: io::ErrorKind::Other,
            message: message.into(),
        }
    }

    /// True for errors that carry state a caller may want to act on
    /// (client certificate selection, proxy credentials).
    pub fn has_additional_state(&self) -> bool {
        matches!(self, Self::CertificateError(_) | Self::AuthRequested(_))
    }
}

impl From<io::Error> for PoolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::NotConnected => Self::NotConnected,
            kind => Self::ConnectionFailed {
                kind,
                message: err.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
