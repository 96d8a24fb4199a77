//! Error types for the server framework.

use thiserror::Error;

use mailwire_codec::DecodeError;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Unrecoverable framing error.
    #[error("Framing error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate or key file could not be loaded.
    #[error("Failed to load {path}: {reason}")]
    Pem {
        /// File path.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// A handler asked for STARTTLS but no TLS context is installed.
    #[error("STARTTLS requested but TLS is not configured")]
    TlsUnavailable,

    /// The peer sent data after requesting STARTTLS, before the handshake.
    #[error("Plaintext data received before TLS handshake")]
    PlaintextBeforeTls,

    /// A handler rejected the session.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns true if the error only means the peer went away.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            )
        )
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;
