//! Error types for mail client connections.

use std::time::Duration;

use thiserror::Error;

use crate::State;

/// Errors that can occur during mail client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Server output could not be framed.
    #[error("Framing error: {0}")]
    Decode(#[from] mailwire_codec::DecodeError),

    /// SASL mechanism failure.
    #[error("SASL error: {0}")]
    Sasl(#[from] mailwire_sasl::Error),

    /// Server sent a challenge that is not valid base64.
    #[error("Invalid base64 challenge: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Server rejected a command.
    #[error("{command} failed: {message}")]
    Command {
        /// Command name.
        command: String,
        /// Error text supplied by the server.
        message: String,
    },

    /// Server rejected the connection in its greeting.
    #[error("Server rejected connection: {0}")]
    Greeting(String),

    /// Server output did not follow the protocol.
    #[error("Protocol error: {0}")]
    Parse(String),

    /// Operation called in the wrong connection state.
    #[error("Illegal state: expected {expected}, was {actual}")]
    IllegalState {
        /// State the operation requires.
        expected: State,
        /// State the connection was in.
        actual: State,
    },

    /// Read or connect timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection is not open.
    #[error("Connection is closed")]
    Closed,
}

impl Error {
    /// Creates a command failure.
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns true if the connection is still usable after this error.
    ///
    /// A protocol-level rejection leaves the session intact; framing, I/O and
    /// parse failures do not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Command { .. } | Self::IllegalState { .. } | Self::Config(_)
        )
    }

    /// Returns true if this error was caused by a read or connect timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = Error::command("LOGIN", "[AUTHENTICATIONFAILED] bad password");
        assert_eq!(
            err.to_string(),
            "LOGIN failed: [AUTHENTICATIONFAILED] bad password"
        );
        assert!(err.is_recoverable());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_parse_error_is_fatal() {
        assert!(!Error::Parse("garbage".into()).is_recoverable());
        assert!(!Error::Closed.is_recoverable());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_timeout());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(Error::Io(io).is_timeout());
    }

    #[test]
    fn test_illegal_state_display() {
        let err = Error::IllegalState {
            expected: State::NotAuthenticated,
            actual: State::Authenticated,
        };
        assert_eq!(
            err.to_string(),
            "Illegal state: expected NOT_AUTHENTICATED, was AUTHENTICATED"
        );
    }
}
