//! Error types for the milter dispatcher.

use thiserror::Error;

/// Milter errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A command payload did not have the expected layout.
    #[error("Malformed {command} payload: {reason}")]
    Malformed {
        /// Command name.
        command: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The group directory could not answer.
    #[error("Directory error: {0}")]
    Directory(String),

    /// Transport or server framework error.
    #[error("Server error: {0}")]
    Server(#[from] mailwire_server::Error),
}

impl Error {
    pub(crate) fn malformed(command: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            command,
            reason: reason.into(),
        }
    }
}

/// Result type alias for milter operations.
pub type Result<T> = std::result::Result<T, Error>;
