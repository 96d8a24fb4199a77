//! # mailwire-server
//!
//! Async connection server framework for mailwire listeners.
//!
//! A [`Server`] owns a TCP listener and runs one task per accepted
//! connection. Each connection gets its own frame decoder and
//! [`Handler`], created by a [`HandlerFactory`]. Handlers are synchronous:
//! they queue writes on the [`Session`] and the connection task flushes them.
//!
//! ## Lifecycle
//!
//! - Sessions beyond [`ServerConfig::max_sessions`] are refused at accept
//!   time, before any protocol exchange.
//! - Frame dispatch is bounded by [`ServerConfig::workers`].
//! - An inactive connection gets [`Handler::on_idle`] and is closed.
//! - [`ServerHandle::shutdown`] stops accepting, interrupts idle sessions,
//!   lets busy ones finish their frame and aborts whatever is left after
//!   [`ServerConfig::shutdown_grace`].
//! - Closing a connection drains queued writes for at most
//!   [`ServerConfig::drain_timeout`].
//!
//! ## Example
//!
//! ```ignore
//! use mailwire_codec::{Frame, LineDecoder};
//! use mailwire_server::{Handler, HandlerFactory, Server, ServerConfig, Session};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type Decoder = LineDecoder;
//!
//!     fn decoder(&self, config: &ServerConfig) -> LineDecoder {
//!         LineDecoder::new(config.max_line_length, config.max_literal_size).without_literals()
//!     }
//!
//!     fn on_frame(&mut self, frame: Frame, session: &mut Session) -> mailwire_server::Result<()> {
//!         if let Frame::Line(line) = frame {
//!             session.write_line(&line);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl HandlerFactory for EchoFactory {
//!     type Handler = Echo;
//!     fn name(&self) -> &str { "echo" }
//!     fn create(&self, _: &Session) -> Echo { Echo }
//! }
//!
//! let config = ServerConfig::builder("echo", "127.0.0.1:7000".parse()?).build()?;
//! let server = Server::bind(config, EchoFactory, None).await?;
//! let handle = server.handle();
//! tokio::spawn(server.run());
//! // ...
//! handle.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
mod connection;
mod error;
mod handler;
mod registry;
pub mod result;
mod server;
mod session;
mod tls;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{Error, Result};
pub use handler::{Handler, HandlerFactory};
pub use registry::{SessionGuard, SessionRegistry};
pub use result::{Record, parse_records, parse_single};
pub use server::{Server, ServerHandle, ShutdownReport};
pub use session::{Session, SessionId, SessionInfo};
pub use tls::{TlsContext, default_cipher_suites};
