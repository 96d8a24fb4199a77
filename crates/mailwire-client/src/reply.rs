//! Server replies.

use bytes::Bytes;

/// Completion status of a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command succeeded (`OK`, `+OK`, 2xx).
    Ok,
    /// Command failed (`NO`, `-ERR`, 4xx/5xx).
    No,
    /// Command was malformed (`BAD`).
    Bad,
    /// Server waits for more client data (`+`, 3xx).
    Continue,
    /// Server is closing the connection (`BYE`).
    Bye,
}

/// One server line, classified by the protocol dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Intermediate data belonging to the pending reply.
    Data(String),
    /// The line that completes the reply.
    Done {
        /// Completion status.
        status: Status,
        /// Numeric reply code, for protocols that have one.
        code: Option<u16>,
        /// Human-readable text.
        text: String,
    },
}

/// A complete server reply.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Completion status.
    pub status: Status,
    /// Numeric reply code, for protocols that have one.
    pub code: Option<u16>,
    /// Text of the completion line.
    pub text: String,
    /// The completion line as received.
    pub line: String,
    /// Intermediate data lines, in arrival order.
    pub data: Vec<String>,
    /// Literal payloads embedded in the data lines.
    pub literals: Vec<Bytes>,
}

impl Reply {
    /// Returns true if the command succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Returns true if the server waits for a continuation.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.status == Status::Continue
    }

    /// Returns all text lines: the data lines followed by the completion text.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.data
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.text.as_str()))
    }
}

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
    fn test_lines_include_completion_text() {
        let reply = Reply {
            status: Status::Ok,
            code: Some(250),
            text: "AUTH PLAIN".to_string(),
            line: "250 AUTH PLAIN".to_string(),
            data: vec!["smtp.example.com".to_string(), "STARTTLS".to_string()],
            literals: Vec::new(),
        };
        let lines: Vec<&str> = reply.lines().collect();
        assert_eq!(lines, vec!["smtp.example.com", "STARTTLS", "AUTH PLAIN"]);
        assert!(reply.is_ok());
        assert!(!reply.is_continuation());
    }
}
