//! # mailwire-milter
//!
//! Milter filter enforcing distribution-list posting policy.
//!
//! For every recipient the MTA reports, the filter asks a [`Directory`]
//! whether the address is a group and whether the envelope sender may post
//! to it. Denied postings get a `554 5.7.1` reply; allowed ones are
//! remembered and, at end of body, listed in an `X-Zimbra-DL` header
//! together with a `Reply-To` header built from each group's reply-to
//! settings.
//!
//! [`MilterHandler`] is the sans-I/O dispatcher for one connection.
//! [`MilterService`] plugs it into a `mailwire-server` listener.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailwire_milter::{CachedDirectory, MilterService, StaticDirectory};
//! use mailwire_server::ServerConfig;
//!
//! let directory = Arc::new(CachedDirectory::new(StaticDirectory::new(entries)));
//! let config = ServerConfig::builder("milter", "127.0.0.1:7026".parse()?).build()?;
//! let server = MilterService::new(directory.clone()).bind(config, None).await?;
//! server.run().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod context;
mod directory;
mod error;
mod handler;
pub mod protocol;
mod service;

pub use context::{
    ConnectInfo, Family, MAIL_ADDR_MACRO, MacroSet, MilterContext, RCPT_ADDR_MACRO,
    normalize_address,
};
pub use directory::{
    AccessPolicy, CachedDirectory, Directory, Group, GroupEntry, GroupResolver, StaticDirectory,
    format_mailbox,
};
pub use error::{Error, Result};
pub use handler::{LIST_HEADER, MilterHandler, Outcome, REPLY_TO_HEADER};
pub use protocol::Response;
pub use service::{MilterService, MilterSession, PROTOCOL};
