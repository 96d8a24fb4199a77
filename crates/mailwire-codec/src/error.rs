//! Error types for frame decoding.

use thiserror::Error;

/// Errors produced while decoding frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded the configured maximum length.
    #[error("line too long (limit {limit} bytes)")]
    LineTooLong {
        /// Configured maximum line length.
        limit: usize,
    },

    /// A literal marker was present but its length was unusable.
    #[error("invalid literal format: {line}")]
    InvalidLiteral {
        /// The request line carrying the marker.
        line: String,
    },

    /// A literal exceeded the configured maximum size.
    #[error("literal too big ({size} bytes, limit {limit}): {line}")]
    LiteralTooBig {
        /// The request line carrying the marker.
        line: String,
        /// Declared literal size.
        size: usize,
        /// Configured maximum literal size.
        limit: usize,
    },

    /// A packet declared a length that cannot hold a command byte.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(i32),

    /// A packet exceeded the configured maximum size.
    #[error("packet too large ({size} bytes, limit {limit})")]
    PacketTooLarge {
        /// Declared packet length.
        size: usize,
        /// Configured maximum packet size.
        limit: usize,
    },
}

impl DecodeError {
    /// Returns true if decoding can continue with the same decoder and buffer.
    ///
    /// Only the offending unit is lost; the stream stays in sync.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LineTooLong { .. } | Self::InvalidLiteral { .. } | Self::LiteralTooBig { .. }
        )
    }
}

/// Result type alias using [`DecodeError`].
pub type Result<T> = std::result::Result<T, DecodeError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(DecodeError::LineTooLong { limit: 10 }.is_recoverable());
        assert!(
            DecodeError::InvalidLiteral {
                line: "A1 APPEND x {-1}".into()
            }
            .is_recoverable()
        );
        assert!(!DecodeError::InvalidPacketLength(-3).is_recoverable());
        assert!(
            !DecodeError::Io(std::io::Error::other("reset")).is_recoverable()
        );
    }

    #[test]
    fn test_literal_too_big_message_reports_line() {
        let err = DecodeError::LiteralTooBig {
            line: "A1 APPEND INBOX {999}".into(),
            size: 999,
            limit: 10,
        };
        assert!(err.to_string().contains("literal too big"));
        assert!(err.to_string().contains("A1 APPEND INBOX {999}"));
    }
}
