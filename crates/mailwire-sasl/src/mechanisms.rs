//! Built-in SASL mechanisms.
//!
//! - PLAIN (RFC 4616): `[authzid]\0authcid\0password`
//! - OAUTHBEARER (RFC 7628): `n,a=<user>,\x01auth=Bearer <token>\x01\x01`
//! - XOAUTH2 (Google/Microsoft): `user=<user>\x01auth=Bearer <token>\x01\x01`
//! - EXTERNAL (RFC 4422 appendix A): the authorization identity, or nothing

use crate::{EXTERNAL, Error, OAUTHBEARER, PLAIN, Result, SaslAuthenticator, XOAUTH2};

/// Parses an `OAuth2` error challenge from the server.
///
/// `OAuth2` errors are JSON-encoded: `{"status":"401", "schemes":"bearer", "scope":"..."}`
///
/// # Errors
///
/// Returns an error if the response cannot be parsed.
pub fn parse_oauth_error(response: &str) -> std::result::Result<OAuthError, serde_json::Error> {
    serde_json::from_str(response)
}

/// `OAuth2` error response from server.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuthError {
    /// HTTP status code.
    pub status: String,
    /// Authentication schemes supported.
    #[serde(default)]
    pub schemes: String,
    /// `OAuth2` scope required.
    #[serde(default)]
    pub scope: Option<String>,
}

/// PLAIN mechanism.
pub struct Plain {
    authorization_id: Option<String>,
    authentication_id: String,
    password: String,
    complete: bool,
}

impl Plain {
    /// Creates a PLAIN authenticator.
    #[must_use]
    pub const fn new(
        authorization_id: Option<String>,
        authentication_id: String,
        password: String,
    ) -> Self {
        Self {
            authorization_id,
            authentication_id,
            password,
            complete: false,
        }
    }
}

impl SaslAuthenticator for Plain {
    fn mechanism(&self) -> &str {
        PLAIN
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if self.complete {
            return Err(Error::AlreadyComplete);
        }
        if !challenge.is_empty() {
            return Err(Error::InvalidChallenge(
                "PLAIN expects an empty challenge".to_string(),
            ));
        }
        self.complete = true;
        let authzid = self.authorization_id.as_deref().unwrap_or_default();
        Ok(format!("{authzid}\0{}\0{}", self.authentication_id, self.password).into_bytes())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn dispose(&mut self) {
        self.password.clear();
    }
}

/// Bearer-token mechanisms share the error-challenge handling.
fn answer_error_challenge(mechanism: &str, challenge: &[u8], reply: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(challenge);
    match parse_oauth_error(&text) {
        Ok(err) => tracing::warn!(
            mechanism,
            status = %err.status,
            scope = err.scope.as_deref().unwrap_or_default(),
            "bearer token rejected"
        ),
        Err(_) => tracing::warn!(mechanism, challenge = %text, "unparseable error challenge"),
    }
    reply.to_vec()
}

/// XOAUTH2 mechanism.
pub struct XOAuth2 {
    user: String,
    token: String,
    sent: bool,
    answered_error: bool,
}

impl XOAuth2 {
    /// Creates an XOAUTH2 authenticator.
    #[must_use]
    pub const fn new(user: String, token: String) -> Self {
        Self {
            user,
            token,
            sent: false,
            answered_error: false,
        }
    }
}

impl SaslAuthenticator for XOAuth2 {
    fn mechanism(&self) -> &str {
        XOAUTH2
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if self.answered_error {
            return Err(Error::AlreadyComplete);
        }
        if self.sent {
            // The server reports failure as a challenge and waits for an empty reply.
            self.answered_error = true;
            return Ok(answer_error_challenge(XOAUTH2, challenge, b""));
        }
        self.sent = true;
        Ok(format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token).into_bytes())
    }

    fn is_complete(&self) -> bool {
        self.sent
    }

    fn dispose(&mut self) {
        self.token.clear();
    }
}

/// OAUTHBEARER mechanism.
pub struct OAuthBearer {
    user: String,
    token: String,
    sent: bool,
    answered_error: bool,
}

impl OAuthBearer {
    /// Creates an OAUTHBEARER authenticator.
    #[must_use]
    pub const fn new(user: String, token: String) -> Self {
        Self {
            user,
            token,
            sent: false,
            answered_error: false,
        }
    }
}

impl SaslAuthenticator for OAuthBearer {
    fn mechanism(&self) -> &str {
        OAUTHBEARER
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if self.answered_error {
            return Err(Error::AlreadyComplete);
        }
        if self.sent {
            // RFC 7628 section 3.2.3: answer an error challenge with a lone ^A.
            self.answered_error = true;
            return Ok(answer_error_challenge(OAUTHBEARER, challenge, b"\x01"));
        }
        self.sent = true;
        Ok(format!("n,a={},\x01auth=Bearer {}\x01\x01", self.user, self.token).into_bytes())
    }

    fn is_complete(&self) -> bool {
        self.sent
    }

    fn dispose(&mut self) {
        self.token.clear();
    }
}

/// EXTERNAL mechanism; the identity comes from the TLS layer.
pub struct External {
    authorization_id: Option<String>,
    complete: bool,
}

impl External {
    /// Creates an EXTERNAL authenticator.
    #[must_use]
    pub const fn new(authorization_id: Option<String>) -> Self {
        Self {
            authorization_id,
            complete: false,
        }
    }
}

impl SaslAuthenticator for External {
    fn mechanism(&self) -> &str {
        EXTERNAL
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        if self.complete {
            return Err(Error::AlreadyComplete);
        }
        self.complete = true;
        Ok(self
            .authorization_id
            .as_deref()
            .unwrap_or_default()
            .as_bytes()
            .to_vec())
    }

    fn is_complete(&self) -> bool {
        self.complete
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
    fn test_plain_format() {
        let mut auth = Plain::new(None, "test".to_string(), "pass".to_string());
        assert!(!auth.is_complete());
        assert_eq!(auth.initial_response().unwrap(), b"\0test\0pass");
        assert!(auth.is_complete());
    }

    #[test]
    fn test_plain_with_authzid() {
        let mut auth = Plain::new(
            Some("admin".to_string()),
            "test".to_string(),
            "pass".to_string(),
        );
        assert_eq!(auth.initial_response().unwrap(), b"admin\0test\0pass");
    }

    #[test]
    fn test_plain_rejects_second_challenge() {
        let mut auth = Plain::new(None, "u".to_string(), "p".to_string());
        auth.initial_response().unwrap();
        assert!(matches!(
            auth.evaluate_challenge(b""),
            Err(Error::AlreadyComplete)
        ));
    }

    #[test]
    fn test_oauthbearer_format() {
        let mut auth = OAuthBearer::new("test@test.com".to_string(), "abc".to_string());
        let response = auth.initial_response().unwrap();
        assert_eq!(response, b"n,a=test@test.com,\x01auth=Bearer abc\x01\x01");
    }

    #[test]
    fn test_xoauth2_format() {
        let mut auth = XOAuth2::new("test@test.com".to_string(), "abc".to_string());
        let response = auth.initial_response().unwrap();
        assert_eq!(response, b"user=test@test.com\x01auth=Bearer abc\x01\x01");
        assert!(auth.is_complete());
    }

    #[test]
    fn test_xoauth2_error_challenge_gets_empty_reply() {
        let mut auth = XOAuth2::new("u".to_string(), "t".to_string());
        auth.initial_response().unwrap();
        let reply = auth
            .evaluate_challenge(br#"{"status":"401","schemes":"bearer"}"#)
            .unwrap();
        assert!(reply.is_empty());
        assert!(auth.is_complete());
    }

    #[test]
    fn test_oauthbearer_error_challenge_gets_ctrl_a() {
        let mut auth = OAuthBearer::new("u".to_string(), "t".to_string());
        auth.initial_response().unwrap();
        let reply = auth.evaluate_challenge(b"not json").unwrap();
        assert_eq!(reply, b"\x01");
        assert!(matches!(
            auth.evaluate_challenge(b""),
            Err(Error::AlreadyComplete)
        ));
    }

    #[test]
    fn test_external_response() {
        let mut auth = External::new(None);
        assert!(auth.initial_response().unwrap().is_empty());
        let mut auth = External::new(Some("other".to_string()));
        assert_eq!(auth.initial_response().unwrap(), b"other");
    }

    #[test]
    fn test_parse_oauth_error() {
        let json = r#"{"status":"401","schemes":"bearer","scope":"https://mail.google.com/"}"#;
        let error = parse_oauth_error(json).unwrap();

        assert_eq!(error.status, "401");
        assert_eq!(error.schemes, "bearer");
        assert_eq!(error.scope.as_deref(), Some("https://mail.google.com/"));
    }

    #[test]
    fn test_parse_oauth_error_without_scope() {
        let error = parse_oauth_error(r#"{"status":"400"}"#).unwrap();
        assert_eq!(error.status, "400");
        assert!(error.scope.is_none());
    }

    #[test]
    fn test_dispose_clears_secret() {
        let mut auth = XOAuth2::new("u".to_string(), "secret".to_string());
        auth.dispose();
        assert!(auth.token.is_empty());
    }
}
