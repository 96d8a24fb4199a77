//! Server TLS context.
//!
//! The context is built once at startup and shared by every listener. The
//! enabled cipher suites are the provider's defaults minus an explicit
//! exclude list, computed when the context is created.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{CryptoProvider, aws_lc_rs};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::{Error, Result};

/// Immutable TLS configuration shared by all connections.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    enabled: Vec<String>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Builds a context from a certificate chain and private key.
    ///
    /// `excluded` names cipher suites (case-insensitive, e.g.
    /// `TLS13_CHACHA20_POLY1305_SHA256`) to remove from the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if every suite is excluded or the key does not match.
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        excluded: &[String],
    ) -> Result<Self> {
        let mut provider = aws_lc_rs::default_provider();
        provider
            .cipher_suites
            .retain(|suite| !is_excluded(&suite_name(suite), excluded));
        if provider.cipher_suites.is_empty() {
            return Err(Error::Config(
                "every TLS cipher suite is excluded".into(),
            ));
        }
        let enabled: Vec<String> = provider.cipher_suites.iter().map(suite_name).collect();
        debug!(suites = ?enabled, "TLS cipher suites enabled");

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            enabled,
        })
    }

    /// Loads the certificate chain and key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pem`] if a file cannot be read or parsed.
    pub fn from_pem_files(cert: &Path, key: &Path, excluded: &[String]) -> Result<Self> {
        let certs = CertificateDer::pem_file_iter(cert)
            .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| pem_error(cert, &e))?;
        if certs.is_empty() {
            return Err(Error::Pem {
                path: cert.display().to_string(),
                reason: "no certificates found".into(),
            });
        }
        let key = PrivateKeyDer::from_pem_file(key).map_err(|e| pem_error(key, &e))?;
        Self::new(certs, key, excluded)
    }

    /// Names of the enabled cipher suites, in preference order.
    #[must_use]
    pub fn enabled_cipher_suites(&self) -> &[String] {
        &self.enabled
    }

    /// Acceptor for server-side handshakes.
    #[must_use]
    pub const fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

fn suite_name(suite: &rustls::SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn is_excluded(name: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|e| e.trim().eq_ignore_ascii_case(name))
}

fn pem_error(path: &Path, err: &rustls::pki_types::pem::Error) -> Error {
    Error::Pem {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Returns the names of the suites enabled by default.
#[must_use]
pub fn default_cipher_suites() -> Vec<String> {
    let provider: CryptoProvider = aws_lc_rs::default_provider();
    provider.cipher_suites.iter().map(suite_name).collect()
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
    use rustls::pki_types::PrivatePkcs8KeyDer;

    use super::*;

    fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        (vec![certified.cert.der().clone()], key.into())
    }

    #[test]
    fn test_defaults_enabled_without_exclusions() {
        let (certs, key) = self_signed();
        let ctx = TlsContext::new(certs, key, &[]).unwrap();
        assert_eq!(ctx.enabled_cipher_suites(), default_cipher_suites().as_slice());
    }

    #[test]
    fn test_exclusions_are_case_insensitive() {
        let (certs, key) = self_signed();
        let defaults = default_cipher_suites();
        let first = defaults[0].to_lowercase();
        let ctx = TlsContext::new(certs, key, &[first, "NOT_A_SUITE".into()]).unwrap();
        assert_eq!(ctx.enabled_cipher_suites().len(), defaults.len() - 1);
        assert!(!ctx.enabled_cipher_suites().contains(&defaults[0]));
    }

    #[test]
    fn test_excluding_everything_fails() {
        let (certs, key) = self_signed();
        let err = TlsContext::new(certs, key, &default_cipher_suites()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_pem_file() {
        let err = TlsContext::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Pem { ref path, .. } if path == "/nonexistent/cert.pem"));
    }
}
