//! Connection configuration types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mailwire_sasl::{AuthenticatorFactory, DefaultAuthenticatorFactory};

use crate::stream::{SocketFactory, TcpSocketFactory, default_tls_config};
use crate::{Error, Result};

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption. **Not recommended for production.**
    None,
    /// TLS from the start.
    Ssl,
    /// Start with plaintext, require a STARTTLS upgrade.
    #[default]
    Tls,
    /// Attempt STARTTLS, continue in plaintext if the server refuses.
    TlsIfAvailable,
}

impl Security {
    /// Returns true if TLS is negotiated before the greeting.
    #[must_use]
    pub const fn is_implicit(self) -> bool {
        matches!(self, Self::Ssl)
    }
}

/// Mail connection configuration.
#[derive(Clone)]
pub struct MailConfig {
    /// Server hostname.
    pub host: String,
    /// Server port; the protocol default for the security mode if unset.
    pub port: Option<u16>,
    /// Security mode.
    pub security: Security,
    /// Authentication identity.
    pub authentication_id: Option<String>,
    /// Authorization identity.
    pub authorization_id: Option<String>,
    /// SASL mechanism; plain login if unset.
    pub mechanism: Option<String>,
    /// SASL realm.
    pub realm: Option<String>,
    /// Mechanism-specific SASL properties.
    pub properties: HashMap<String, String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
    /// Send the SASL initial response with the authenticate command.
    pub initial_response: bool,
    /// Domain announced in SMTP EHLO/HELO.
    pub domain: Option<String>,
    /// Opens the transport socket.
    pub socket_factory: Arc<dyn SocketFactory>,
    /// TLS client configuration.
    pub tls_config: Arc<rustls::ClientConfig>,
    /// Builds SASL authenticators.
    pub authenticator_factory: Arc<dyn AuthenticatorFactory>,
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("authentication_id", &self.authentication_id)
            .field("authorization_id", &self.authorization_id)
            .field("mechanism", &self.mechanism)
            .field("realm", &self.realm)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("initial_response", &self.initial_response)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl MailConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> MailConfigBuilder {
        MailConfigBuilder::new(host)
    }
}

/// Builder for mail connection configuration.
pub struct MailConfigBuilder {
    config: MailConfig,
}

impl MailConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: MailConfig {
                host: host.into(),
                port: None,
                security: Security::default(),
                authentication_id: None,
                authorization_id: None,
                mechanism: None,
                realm: None,
                properties: HashMap::new(),
                connect_timeout: Duration::from_secs(30),
                read_timeout: Duration::from_secs(60),
                initial_response: true,
                domain: None,
                socket_factory: Arc::new(TcpSocketFactory),
                tls_config: default_tls_config(),
                authenticator_factory: Arc::new(DefaultAuthenticatorFactory),
            },
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.config.security = security;
        self
    }

    /// Sets the authentication identity.
    #[must_use]
    pub fn authentication_id(mut self, id: impl Into<String>) -> Self {
        self.config.authentication_id = Some(id.into());
        self
    }

    /// Sets the authorization identity.
    #[must_use]
    pub fn authorization_id(mut self, id: impl Into<String>) -> Self {
        self.config.authorization_id = Some(id.into());
        self
    }

    /// Sets the SASL mechanism.
    #[must_use]
    pub fn mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.config.mechanism = Some(mechanism.into());
        self
    }

    /// Sets the SASL realm.
    #[must_use]
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.config.realm = Some(realm.into());
        self
    }

    /// Adds a SASL property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Enables or disables the SASL initial response.
    #[must_use]
    pub const fn initial_response(mut self, enabled: bool) -> Self {
        self.config.initial_response = enabled;
        self
    }

    /// Sets the SMTP hello domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = Some(domain.into());
        self
    }

    /// Sets the socket factory.
    #[must_use]
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.config.socket_factory = factory;
        self
    }

    /// Sets the TLS client configuration.
    #[must_use]
    pub fn tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls_config = tls_config;
        self
    }

    /// Sets the SASL authenticator factory.
    #[must_use]
    pub fn authenticator_factory(mut self, factory: Arc<dyn AuthenticatorFactory>) -> Self {
        self.config.authenticator_factory = factory;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty, the port is zero, or a timeout is zero.
    pub fn build(self) -> Result<MailConfig> {
        let config = self.config;
        if config.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if config.port == Some(0) {
            return Err(Error::Config("port must not be zero".into()));
        }
        if config.connect_timeout.is_zero() || config.read_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(config)
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
    fn test_builder_defaults() {
        let config = MailConfig::builder("imap.example.com").build().unwrap();
        assert_eq!(config.host, "imap.example.com");
        assert_eq!(config.port, None);
        assert_eq!(config.security, Security::Tls);
        assert!(config.initial_response);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builder_fields() {
        let config = MailConfig::builder("mail.example.com")
            .port(2525)
            .security(Security::TlsIfAvailable)
            .authentication_id("user")
            .authorization_id("admin")
            .mechanism("PLAIN")
            .realm("example.com")
            .property("qop", "auth")
            .domain("client.example.com")
            .initial_response(false)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.port, Some(2525));
        assert_eq!(config.security, Security::TlsIfAvailable);
        assert_eq!(config.authentication_id.as_deref(), Some("user"));
        assert_eq!(config.authorization_id.as_deref(), Some("admin"));
        assert_eq!(config.mechanism.as_deref(), Some("PLAIN"));
        assert_eq!(config.properties.get("qop").map(String::as_str), Some("auth"));
        assert!(!config.initial_response);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_build_rejects_invalid_values() {
        assert!(matches!(
            MailConfig::builder(" ").build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MailConfig::builder("h").port(0).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MailConfig::builder("h").read_timeout(Duration::ZERO).build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_implicit_security() {
        assert!(Security::Ssl.is_implicit());
        assert!(!Security::Tls.is_implicit());
        assert!(!Security::TlsIfAvailable.is_implicit());
    }
}
