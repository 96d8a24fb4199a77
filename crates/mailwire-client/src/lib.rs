//! # mailwire-client
//!
//! Client connection state machine for IMAP, POP3 and SMTP.
//!
//! One generic [`MailConnection`] runs connect, STARTTLS, login, SASL
//! authentication and logout for all three protocols. What differs between
//! them (command syntax, reply classification, greeting and handshake) lives
//! in a [`Dialect`]: [`Imap`], [`Pop3`] or [`Smtp`].
//!
//! ## Example
//!
//! ```ignore
//! use mailwire_client::{MailConfig, MailConnection, Security, Smtp};
//!
//! let config = MailConfig::builder("smtp.example.com")
//!     .security(Security::Tls)
//!     .authentication_id("user@example.com")
//!     .build()?;
//!
//! let mut conn = MailConnection::<Smtp>::new(config);
//! conn.connect().await?;
//! conn.authenticate("password").await?;
//! let report = conn
//!     .send_message("user@example.com", &["friend@example.org"], b"Subject: hi\r\n\r\nhello\r\n")
//!     .await?;
//! conn.logout().await?;
//! ```
//!
//! ## States
//!
//! ```text
//! Closed -> NotAuthenticated -> Authenticated -> Selected
//!    ^            |                  |              |
//!    +------------+---- Logout <-----+--------------+
//! ```
//!
//! Operations check the state first and fail with
//! [`Error::IllegalState`] without touching the wire.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
mod connection;
pub mod dialect;
mod error;
mod reply;
mod stream;
mod tag;
mod transport;

pub use config::{MailConfig, MailConfigBuilder, Security};
pub use connection::{MailConnection, State};
pub use dialect::{Dialect, Imap, Mailbox, Pop3, SendReport, Smtp};
pub use error::{Error, Result};
pub use reply::{Classified, Reply, Status};
pub use stream::{
    AsyncStream, BoxFuture, BoxStream, SocketFactory, TcpSocketFactory, default_tls_config,
    upgrade_to_tls,
};
pub use tag::TagGenerator;
