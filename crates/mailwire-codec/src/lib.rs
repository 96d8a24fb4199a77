//! # mailwire-codec
//!
//! Incremental frame decoders shared by every mailwire protocol endpoint.
//!
//! Both decoders are sans-I/O: they consume bytes from a [`bytes::BytesMut`]
//! buffer that the caller fills from whatever transport it owns, and they
//! implement [`tokio_util::codec::Decoder`] so they also plug into
//! `FramedRead`. A decoder never hands out a partial frame. When the buffer
//! does not yet hold a complete unit it returns `Ok(None)` and leaves the
//! buffered bytes in place for the next attempt.
//!
//! ## Decoders
//!
//! - [`LineDecoder`]: LF-terminated text lines (a CR directly before the LF is
//!   part of the terminator) with IMAP-style `{N}` / `{N+}` literals.
//! - [`PacketCodec`]: `[4-byte big-endian length][command][payload]` packets as
//!   used by the milter protocol.
//!
//! ## Error recovery
//!
//! [`DecodeError::is_recoverable`] separates framing errors that only spoil
//! a single unit (overlong line, malformed or oversized literal) from errors
//! that desynchronise the stream. After a recoverable error the same decoder
//! instance can keep decoding the same buffer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod error;
mod line;
mod literal;
mod packet;

pub use error::{DecodeError, Result};
pub use line::{Frame, LineDecoder};
pub use literal::{Literal, parse_literal};
pub use packet::{Packet, PacketCodec};

/// Default maximum length of a single protocol line, excluding the terminator.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Default maximum size of a single literal.
pub const DEFAULT_MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// Default maximum size of a length-prefixed packet body.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
