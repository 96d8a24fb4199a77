//! Protocol dialects.
//!
//! A [`Dialect`] supplies everything protocol-specific about a mail client
//! session: command syntax, how server lines are classified, and how the
//! greeting, handshake, login and authenticate exchanges are spelled. The
//! generic [`MailConnection`](crate::MailConnection) drives the I/O.

mod imap;
mod pop3;
mod smtp;

pub use imap::{Imap, Mailbox, needs_literal, quote_astring};
pub use pop3::Pop3;
pub use smtp::{SendReport, Smtp, dot_stuff};

use crate::reply::{Classified, Reply};
use crate::{MailConfig, Result, Security, State};

/// A command ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Tag that marks the completion line, for tagged protocols.
    pub tag: Option<String>,
    /// Command name, used in error reports.
    pub name: String,
    /// Full line without CRLF.
    pub line: String,
}

impl Request {
    /// Creates an untagged request.
    #[must_use]
    pub fn untagged(command: &str) -> Self {
        Self {
            tag: None,
            name: command_name(command),
            line: command.to_string(),
        }
    }
}

/// Returns the upper-cased first word of a command line.
#[must_use]
pub fn command_name(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// One step of a plain login exchange.
#[derive(Clone, PartialEq, Eq)]
pub enum LoginStep {
    /// A command line.
    Command(String),
    /// A raw line answering a continuation.
    Respond(String),
}

impl std::fmt::Debug for LoginStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(c) => write!(f, "Command({})", command_name(c)),
            Self::Respond(_) => f.write_str("Respond(<redacted>)"),
        }
    }
}

/// Protocol-specific behavior of a mail client session.
pub trait Dialect: Default + Send + Sync {
    /// Protocol name for logs.
    const NAME: &'static str;

    /// SASL service name.
    const SERVICE: &'static str;

    /// Returns the default port for the security mode.
    fn default_port(security: Security) -> u16;

    /// Returns true if server lines may announce `{N}` literals.
    fn supports_literals() -> bool {
        false
    }

    /// Prepares a command for sending.
    fn request(&mut self, command: &str) -> Request {
        Request::untagged(command)
    }

    /// Classifies one server line. `tag` is the pending command's tag, or
    /// `None` while reading the greeting or in untagged protocols.
    ///
    /// # Errors
    ///
    /// Returns an error if the line does not follow the protocol.
    fn classify(&self, tag: Option<&str>, line: &str) -> Result<Classified>;

    /// Interprets the greeting and returns the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refused the connection.
    fn greeting(&mut self, reply: &Reply) -> Result<State>;

    /// Commands tried in order after the greeting and after STARTTLS until
    /// one succeeds. Empty if the protocol needs no handshake.
    fn handshake(&self, _config: &MailConfig) -> Vec<String> {
        Vec::new()
    }

    /// Records the successful handshake reply.
    fn record_handshake(&mut self, _reply: &Reply) {}

    /// Records session details from any successful reply.
    fn observe(&mut self, _reply: &Reply) {}

    /// Forgets what was learned before the TLS upgrade.
    fn reset_after_tls(&mut self) {}

    /// STARTTLS command.
    fn starttls_command(&self) -> &'static str;

    /// Plain login exchange.
    fn login_steps(&self, user: &str, password: &str) -> Vec<LoginStep>;

    /// SASL authenticate command, with the base64 initial response if any.
    fn authenticate_command(&self, mechanism: &str, initial_response: Option<&str>) -> String;

    /// Returns true if the server accepts an initial response with the command.
    fn allows_initial_response(&self) -> bool {
        true
    }

    /// Mechanism to use when none is configured.
    fn preferred_mechanism(&self) -> Option<&'static str> {
        None
    }

    /// Logout command.
    fn logout_command(&self) -> &'static str;
}

/// Formats a SASL initial response; an empty response is sent as `=`.
pub(crate) fn initial_response_arg(response: &str) -> &str {
    if response.is_empty() { "=" } else { response }
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
    fn test_command_name() {
        assert_eq!(command_name("auth login"), "AUTH");
        assert_eq!(command_name("EHLO client.example.com"), "EHLO");
        assert_eq!(command_name(""), "");
    }

    #[test]
    fn test_login_step_debug_redacts() {
        let step = LoginStep::Respond("c2VjcmV0".to_string());
        assert_eq!(format!("{step:?}"), "Respond(<redacted>)");
        let step = LoginStep::Command("LOGIN user secret".to_string());
        assert_eq!(format!("{step:?}"), "Command(LOGIN)");
    }

    #[test]
    fn test_empty_initial_response() {
        assert_eq!(initial_response_arg(""), "=");
        assert_eq!(initial_response_arg("AGEAYg=="), "AGEAYg==");
    }
}
