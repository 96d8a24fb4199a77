//! # mailwire-sasl
//!
//! SASL client support for the mailwire protocol clients.
//!
//! ## Features
//!
//! - **Pluggable mechanisms**: [`SaslAuthenticator`] is the per-session
//!   mechanism state; an [`AuthenticatorFactory`] builds one from
//!   [`AuthParams`]. [`DefaultAuthenticatorFactory`] covers PLAIN (RFC 4616),
//!   OAUTHBEARER (RFC 7628), XOAUTH2 and EXTERNAL (RFC 4422 appendix A).
//! - **Security layers**: when a mechanism negotiates integrity or
//!   confidentiality protection, [`SaslStream`] wraps the transport and frames
//!   every buffer as RFC 4422 section 3.7 requires.
//!
//! The protocol client owns the base64 step: authenticators consume and
//! produce raw bytes.
//!
//! ## Example
//!
//! ```
//! use mailwire_sasl::{AuthParams, AuthenticatorFactory, DefaultAuthenticatorFactory};
//!
//! let params = AuthParams::new("PLAIN", "user@example.com").password("secret");
//! let mut auth = DefaultAuthenticatorFactory.create(&params).unwrap();
//! assert!(auth.has_initial_response());
//! let response = auth.initial_response().unwrap();
//! assert_eq!(response, b"\0user@example.com\0secret");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod authenticator;
mod error;
mod layer;
pub mod mechanisms;

pub use authenticator::{
    AuthParams, AuthenticatorFactory, DefaultAuthenticatorFactory, Qop, SaslAuthenticator,
};
pub use error::{Error, Result};
pub use layer::{SaslStream, SecurityLayer};
pub use mechanisms::{OAuthError, parse_oauth_error};

/// Mechanism name for PLAIN.
pub const PLAIN: &str = "PLAIN";
/// Mechanism name for LOGIN, which protocol clients map to their plain login command.
pub const LOGIN: &str = "LOGIN";
/// Mechanism name for XOAUTH2.
pub const XOAUTH2: &str = "XOAUTH2";
/// Mechanism name for OAUTHBEARER.
pub const OAUTHBEARER: &str = "OAUTHBEARER";
/// Mechanism name for EXTERNAL.
pub const EXTERNAL: &str = "EXTERNAL";
