//! Authenticator trait and factory.

use std::collections::HashMap;
use std::fmt;

use crate::layer::SecurityLayer;
use crate::mechanisms::{External, OAuthBearer, Plain, XOAuth2};
use crate::{EXTERNAL, Error, OAUTHBEARER, PLAIN, Result, XOAUTH2};

/// Negotiated SASL quality of protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    /// Authentication only.
    Auth,
    /// Authentication with integrity protection.
    AuthInt,
    /// Authentication with integrity and confidentiality protection.
    AuthConf,
}

impl Qop {
    /// Returns the RFC 2831 token for this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthInt => "auth-int",
            Self::AuthConf => "auth-conf",
        }
    }

    /// Returns true if buffers must be wrapped after authentication.
    #[must_use]
    pub const fn has_security_layer(self) -> bool {
        matches!(self, Self::AuthInt | Self::AuthConf)
    }
}

impl fmt::Display for Qop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client side of one SASL exchange.
pub trait SaslAuthenticator: Send {
    /// Returns the mechanism name as sent on the wire.
    fn mechanism(&self) -> &str;

    /// Returns true if the mechanism can send data with the authenticate command.
    fn has_initial_response(&self) -> bool;

    /// Produces the initial response.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism cannot build a response.
    fn initial_response(&mut self) -> Result<Vec<u8>> {
        self.evaluate_challenge(&[])
    }

    /// Answers a server challenge (already base64-decoded).
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge is malformed or unexpected.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Returns true once the client has nothing more to send.
    fn is_complete(&self) -> bool;

    /// Returns the negotiated quality of protection, if the mechanism negotiates one.
    fn negotiated_qop(&self) -> Option<Qop> {
        None
    }

    /// Hands out the security layer negotiated by the exchange.
    ///
    /// Called once after the server reports success.
    fn take_security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        None
    }

    /// Releases mechanism state. Called when the connection closes.
    fn dispose(&mut self) {}
}

/// Inputs for building an authenticator.
#[derive(Clone, Default)]
pub struct AuthParams {
    /// Mechanism name.
    pub mechanism: String,
    /// Authentication identity (the user being authenticated).
    pub authentication_id: String,
    /// Authorization identity to act as, if different.
    pub authorization_id: Option<String>,
    /// Password or bearer token.
    pub password: Option<String>,
    /// Realm, for mechanisms that use one.
    pub realm: Option<String>,
    /// Server host name.
    pub host: Option<String>,
    /// Service name (`imap`, `pop`, `smtp`).
    pub service: Option<String>,
    /// Mechanism-specific properties.
    pub properties: HashMap<String, String>,
}

impl fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthParams")
            .field("mechanism", &self.mechanism)
            .field("authentication_id", &self.authentication_id)
            .field("authorization_id", &self.authorization_id)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("realm", &self.realm)
            .field("host", &self.host)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl AuthParams {
    /// Creates parameters for the given mechanism and authentication identity.
    #[must_use]
    pub fn new(mechanism: impl Into<String>, authentication_id: impl Into<String>) -> Self {
        Self {
            mechanism: mechanism.into(),
            authentication_id: authentication_id.into(),
            ..Self::default()
        }
    }

    /// Sets the password or token.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the authorization identity.
    #[must_use]
    pub fn authorization_id(mut self, authorization_id: impl Into<String>) -> Self {
        self.authorization_id = Some(authorization_id.into());
        self
    }

    pub(crate) fn require_password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or(Error::MissingCredential("password"))
    }
}

/// Builds authenticators for named mechanisms.
pub trait AuthenticatorFactory: Send + Sync {
    /// Creates an authenticator for `params.mechanism`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism is unknown or a credential is missing.
    fn create(&self, params: &AuthParams) -> Result<Box<dyn SaslAuthenticator>>;

    /// Returns true if this factory knows the mechanism.
    fn supports(&self, mechanism: &str) -> bool;
}

/// Factory for the mechanisms implemented in this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAuthenticatorFactory;

impl AuthenticatorFactory for DefaultAuthenticatorFactory {
    fn create(&self, params: &AuthParams) -> Result<Box<dyn SaslAuthenticator>> {
        let mechanism = params.mechanism.to_ascii_uppercase();
        match mechanism.as_str() {
            PLAIN => Ok(Box::new(Plain::new(
                params.authorization_id.clone(),
                params.authentication_id.clone(),
                params.require_password()?.to_string(),
            ))),
            XOAUTH2 => Ok(Box::new(XOAuth2::new(
                params.authentication_id.clone(),
                params.require_password()?.to_string(),
            ))),
            OAUTHBEARER => Ok(Box::new(OAuthBearer::new(
                params.authentication_id.clone(),
                params.require_password()?.to_string(),
            ))),
            EXTERNAL => Ok(Box::new(External::new(params.authorization_id.clone()))),
            _ => Err(Error::UnsupportedMechanism(params.mechanism.clone())),
        }
    }

    fn supports(&self, mechanism: &str) -> bool {
        [PLAIN, XOAUTH2, OAUTHBEARER, EXTERNAL]
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism))
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
    fn test_factory_mechanisms_case_insensitive() {
        let params = AuthParams::new("plain", "user").password("pw");
        let auth = DefaultAuthenticatorFactory.create(&params).unwrap();
        assert_eq!(auth.mechanism(), PLAIN);
        assert!(DefaultAuthenticatorFactory.supports("xoauth2"));
        assert!(!DefaultAuthenticatorFactory.supports("GSSAPI"));
    }

    #[test]
    fn test_factory_rejects_unknown_mechanism() {
        let params = AuthParams::new("GSSAPI", "user");
        let err = DefaultAuthenticatorFactory.create(&params).err().unwrap();
        assert!(matches!(err, Error::UnsupportedMechanism(m) if m == "GSSAPI"));
    }

    #[test]
    fn test_factory_requires_password() {
        let params = AuthParams::new("OAUTHBEARER", "user");
        let err = DefaultAuthenticatorFactory.create(&params).err().unwrap();
        assert!(matches!(err, Error::MissingCredential("password")));
    }

    #[test]
    fn test_external_needs_no_password() {
        let params = AuthParams::new("EXTERNAL", "user");
        assert!(DefaultAuthenticatorFactory.create(&params).is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let params = AuthParams::new("PLAIN", "user").password("hunter2");
        let printed = format!("{params:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_qop_tokens() {
        assert_eq!(Qop::AuthConf.to_string(), "auth-conf");
        assert!(Qop::AuthInt.has_security_layer());
        assert!(!Qop::Auth.has_security_layer());
    }
}
