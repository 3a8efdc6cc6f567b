//! Error types for outbound-core
//!
//! Errors on the event plane travel upstream as `StreamEnd` reasons (see
//! [`crate::event::StreamError`]); the enums here cover the synchronous API
//! surface: socket setup, local binds, and option validation.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the synchronous outbound API.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// Failed to bind the requested local endpoint
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The bind address string did not parse
    #[error("invalid bind address {addr}: {reason}")]
    InvalidBindAddress { addr: String, reason: String },

    /// Failed to set a socket option
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error not covered by the other variants
    #[error("outbound I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OutboundError {
    /// Check if this error is recoverable (the operation can be retried).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::InvalidBindAddress { .. } | Self::SocketOption { .. } => {
                false
            }
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error.
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// Create a socket option error.
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Option validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is out of its allowed range
    #[error("invalid option {field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },
}

impl ConfigError {
    /// Create an invalid option error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            field,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with [`OutboundError`].
pub type Result<T> = std::result::Result<T, OutboundError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OutboundError::bind(
            "127.0.0.1:80".parse().unwrap(),
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:80"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_recovery_classification() {
        let bind = OutboundError::bind(
            "127.0.0.1:80".parse().unwrap(),
            io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(!bind.is_recoverable());

        let timeout: OutboundError = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert!(timeout.is_recoverable());

        let opt = OutboundError::socket_option("SO_KEEPALIVE", "not supported");
        assert!(!opt.is_recoverable());
    }

    #[test]
    fn test_config_error() {
        let err = ConfigError::invalid("retry_delay", "must be finite");
        assert!(err.to_string().contains("retry_delay"));
    }
}
