//! Listener configuration.

use std::net::SocketAddr;
use std::time::Duration;

use mailwire_codec::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_LITERAL_SIZE, DEFAULT_MAX_PACKET_SIZE};

use crate::{Error, Result};

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listener name for logs.
    pub name: String,
    /// Bind address.
    pub bind: SocketAddr,
    /// Maximum concurrent sessions; further connections are refused.
    pub max_sessions: usize,
    /// Connections processing frames at the same time.
    pub workers: usize,
    /// Inactivity timeout per connection.
    pub idle_timeout: Duration,
    /// Time allowed for sessions to finish after shutdown starts.
    pub shutdown_grace: Duration,
    /// Time allowed to flush queued writes when a connection closes.
    pub drain_timeout: Duration,
    /// Maximum line length for line protocols.
    pub max_line_length: usize,
    /// Maximum literal size for line protocols.
    pub max_literal_size: usize,
    /// Maximum packet size for packet protocols.
    pub max_packet_size: usize,
}

impl ServerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(name: impl Into<String>, bind: SocketAddr) -> ServerConfigBuilder {
        ServerConfigBuilder::new(name, bind)
    }

    /// Checks that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("listener name must not be empty".into()));
        }
        let checks = [
            ("max_sessions", self.max_sessions == 0),
            ("workers", self.workers == 0),
            ("idle_timeout", self.idle_timeout.is_zero()),
            ("drain_timeout", self.drain_timeout.is_zero()),
            ("max_line_length", self.max_line_length == 0),
            ("max_literal_size", self.max_literal_size == 0),
            ("max_packet_size", self.max_packet_size == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, bad)| *bad) {
            return Err(Error::Config(format!(
                "{}: {field} must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a builder with default limits.
    #[must_use]
    pub fn new(name: impl Into<String>, bind: SocketAddr) -> Self {
        Self {
            config: ServerConfig {
                name: name.into(),
                bind,
                max_sessions: 1024,
                workers: 16,
                idle_timeout: Duration::from_secs(300),
                shutdown_grace: Duration::from_secs(10),
                drain_timeout: Duration::from_secs(5),
                max_line_length: DEFAULT_MAX_LINE_LENGTH,
                max_literal_size: DEFAULT_MAX_LITERAL_SIZE,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            },
        }
    }

    /// Sets the session ceiling.
    #[must_use]
    pub const fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Sets the write drain timeout.
    #[must_use]
    pub const fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Sets the maximum line length.
    #[must_use]
    pub const fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Sets the maximum literal size.
    #[must_use]
    pub const fn max_literal_size(mut self, max: usize) -> Self {
        self.config.max_literal_size = max;
        self
    }

    /// Sets the maximum packet size.
    #[must_use]
    pub const fn max_packet_size(mut self, max: usize) -> Self {
        self.config.max_packet_size = max;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero.
    pub fn build(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
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

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::builder("milter", addr()).build().unwrap();
        assert_eq!(config.max_sessions, 1024);
        assert_eq!(config.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_zero_limits_fail_fast() {
        let err = ServerConfig::builder("milter", addr())
            .max_sessions(0)
            .build()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: milter: max_sessions must be greater than zero"
        );

        assert!(
            ServerConfig::builder("milter", addr())
                .idle_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(ServerConfig::builder(" ", addr()).build().is_err());
    }

    #[test]
    fn test_zero_grace_is_allowed() {
        let config = ServerConfig::builder("admin", addr())
            .shutdown_grace(Duration::ZERO)
            .build()
            .unwrap();
        assert!(config.shutdown_grace.is_zero());
    }
}
