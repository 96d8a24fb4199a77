//! Daemon configuration file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mailwire_codec::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_LITERAL_SIZE, DEFAULT_MAX_PACKET_SIZE};
use mailwire_milter::GroupEntry;
use mailwire_server::ServerConfig;
use serde::Deserialize;

/// Default milter port.
pub const DEFAULT_MILTER_PORT: u16 = 7026;

/// Default admin port.
pub const DEFAULT_ADMIN_PORT: u16 = 7027;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default tracing filter; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Milter listener.
    #[serde(default = "ListenerConfig::milter")]
    pub milter: ListenerConfig,
    /// Admin listener.
    #[serde(default = "ListenerConfig::admin")]
    pub admin: ListenerConfig,
    /// TLS for STARTTLS on the listeners.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Runtime sizing.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Static group directory.
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

fn default_log_filter() -> String {
    "info".into()
}

/// One listener; durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    #[serde(default = "defaults::max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "defaults::workers")]
    pub workers: usize,
    #[serde(default = "defaults::idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "defaults::shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "defaults::drain_timeout")]
    pub drain_timeout: u64,
    #[serde(default = "defaults::max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "defaults::max_literal_size")]
    pub max_literal_size: usize,
    #[serde(default = "defaults::max_packet_size")]
    pub max_packet_size: usize,
}

mod defaults {
    pub const fn max_sessions() -> usize {
        1024
    }
    pub const fn workers() -> usize {
        16
    }
    pub const fn idle_timeout() -> u64 {
        300
    }
    pub const fn shutdown_grace() -> u64 {
        10
    }
    pub const fn drain_timeout() -> u64 {
        5
    }
    pub const fn max_line_length() -> usize {
        super::DEFAULT_MAX_LINE_LENGTH
    }
    pub const fn max_literal_size() -> usize {
        super::DEFAULT_MAX_LITERAL_SIZE
    }
    pub const fn max_packet_size() -> usize {
        super::DEFAULT_MAX_PACKET_SIZE
    }
}

impl ListenerConfig {
    fn on_port(port: u16) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], port)),
            max_sessions: defaults::max_sessions(),
            workers: defaults::workers(),
            idle_timeout: defaults::idle_timeout(),
            shutdown_grace: defaults::shutdown_grace(),
            drain_timeout: defaults::drain_timeout(),
            max_line_length: defaults::max_line_length(),
            max_literal_size: defaults::max_literal_size(),
            max_packet_size: defaults::max_packet_size(),
        }
    }

    fn milter() -> Self {
        Self::on_port(DEFAULT_MILTER_PORT)
    }

    fn admin() -> Self {
        Self {
            max_sessions: 8,
            workers: 2,
            ..Self::on_port(DEFAULT_ADMIN_PORT)
        }
    }

    /// Converts to a validated server configuration.
    pub fn to_server_config(&self, name: &str) -> Result<ServerConfig> {
        ServerConfig::builder(name, self.bind)
            .max_sessions(self.max_sessions)
            .workers(self.workers)
            .idle_timeout(Duration::from_secs(self.idle_timeout))
            .shutdown_grace(Duration::from_secs(self.shutdown_grace))
            .drain_timeout(Duration::from_secs(self.drain_timeout))
            .max_line_length(self.max_line_length)
            .max_literal_size(self.max_literal_size)
            .max_packet_size(self.max_packet_size)
            .build()
            .with_context(|| format!("invalid [{name}] section"))
    }
}

/// Certificate, key and cipher exclusions.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub excluded_ciphers: Vec<String>,
}

/// Tokio runtime sizing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker threads; the number of CPUs if unset.
    pub worker_threads: Option<usize>,
    /// Seconds an idle blocking thread is kept alive.
    pub thread_keep_alive: Option<u64>,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// Parses and validates configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.milter.to_server_config("milter")?;
        self.admin.to_server_config("admin")?;
        if self.runtime.worker_threads == Some(0) {
            anyhow::bail!("runtime.worker_threads must be greater than zero");
        }
        if let Some(entry) = self.groups.iter().find(|e| !e.group.mail.contains('@')) {
            anyhow::bail!("group address {:?} is not an email address", entry.group.mail);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            milter: ListenerConfig::milter(),
            admin: ListenerConfig::admin(),
            tls: None,
            runtime: RuntimeConfig::default(),
            groups: Vec::new(),
        }
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

    const SAMPLE: &str = r#"
log_filter = "mailwire=debug"

[milter]
bind = "0.0.0.0:7026"
idle_timeout = 60
max_packet_size = 65536

[admin]
bind = "127.0.0.1:9999"

[tls]
cert = "/etc/mailwire/cert.pem"
key = "/etc/mailwire/key.pem"
excluded_ciphers = ["TLS13_CHACHA20_POLY1305_SHA256"]

[runtime]
worker_threads = 4
thread_keep_alive = 30

[[groups]]
mail = "staff@example.com"
display_name = "Staff"
reply_to_enabled = true
reply_to_address = "help@example.com"
allowed_senders = ["*@example.com"]

[[groups]]
mail = "all@example.com"
"#;

    #[test]
    fn test_parse_full_file() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.log_filter, "mailwire=debug");
        assert_eq!(config.milter.idle_timeout, 60);
        assert_eq!(config.milter.max_sessions, 1024);
        assert_eq!(config.admin.bind.port(), 9999);
        assert_eq!(config.admin.max_sessions, 1024);
        assert_eq!(config.runtime.worker_threads, Some(4));
        assert_eq!(config.tls.unwrap().excluded_ciphers.len(), 1);
        assert_eq!(config.groups.len(), 2);
        assert!(config.groups[0].group.reply_to_enabled);
        assert!(config.groups[1].allowed_senders.is_empty());

        let server = config.milter.to_server_config("milter").unwrap();
        assert_eq!(server.idle_timeout, Duration::from_secs(60));
        assert_eq!(server.max_packet_size, 65536);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.milter.bind.port(), DEFAULT_MILTER_PORT);
        assert_eq!(config.admin.bind.port(), DEFAULT_ADMIN_PORT);
        assert_eq!(config.admin.max_sessions, 8);
        assert!(config.tls.is_none());
        assert!(config.groups.is_empty());
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let err = Config::parse("[milter]\nbind = \"127.0.0.1:1\"\nworkers = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("workers must be greater than zero"));

        assert!(Config::parse("[milter]\nbind = \"not an address\"\n").is_err());
        assert!(Config::parse("[runtime]\nworker_threads = 0\n").is_err());
        assert!(Config::parse("[[groups]]\nmail = \"nobody\"\n").is_err());
        assert!(Config::parse("unknown = 1\n").is_err());
    }
}
