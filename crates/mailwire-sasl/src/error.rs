//! Error types for SASL operations.

use std::io;

/// Result type alias for SASL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SASL error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No authenticator exists for the requested mechanism.
    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    /// A credential required by the mechanism was not supplied.
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    /// The server sent a challenge the mechanism cannot answer.
    #[error("Invalid challenge: {0}")]
    InvalidChallenge(String),

    /// The server kept challenging after the exchange had finished.
    #[error("SASL exchange already complete")]
    AlreadyComplete,

    /// Security layer failed to wrap or unwrap a buffer.
    #[error("Security layer error: {0}")]
    Layer(String),
}
