//! Milter wire constants and response encoding.

use bytes::{BufMut, BytesMut};
use mailwire_codec::Packet;

/// Abort the current message.
pub const SMFIC_ABORT: u8 = b'A';
/// End of body.
pub const SMFIC_BODYEOB: u8 = b'E';
/// Connection information.
pub const SMFIC_CONNECT: u8 = b'C';
/// Macro definitions.
pub const SMFIC_MACRO: u8 = b'D';
/// One header.
pub const SMFIC_HEADER: u8 = b'L';
/// MAIL FROM.
pub const SMFIC_MAIL: u8 = b'M';
/// Option negotiation.
pub const SMFIC_OPTNEG: u8 = b'O';
/// Close the filter connection.
pub const SMFIC_QUIT: u8 = b'Q';
/// RCPT TO.
pub const SMFIC_RCPT: u8 = b'R';

/// Accept the message.
pub const SMFIR_ACCEPT: u8 = b'a';
/// Continue processing.
pub const SMFIR_CONTINUE: u8 = b'c';
/// Change a header.
pub const SMFIR_CHGHEADER: u8 = b'm';
/// Temporary failure.
pub const SMFIR_TEMPFAIL: u8 = b't';
/// Reply with an SMTP code and text.
pub const SMFIR_REPLYCODE: u8 = b'y';

/// Protocol version advertised during option negotiation.
pub const MILTER_VERSION: u32 = 2;

/// The filter may add headers.
pub const SMFIF_ADDHDRS: u32 = 0x01;
/// The filter may change headers.
pub const SMFIF_CHGHDRS: u32 = 0x10;

/// Do not send HELO.
pub const SMFIP_NOHELO: u32 = 0x02;
/// Do not send MAIL FROM.
pub const SMFIP_NOMAIL: u32 = 0x04;
/// Do not send body chunks.
pub const SMFIP_NOBODY: u32 = 0x10;
/// Do not send headers.
pub const SMFIP_NOHDRS: u32 = 0x20;
/// Do not send end of headers.
pub const SMFIP_NOEOH: u32 = 0x40;

/// Actions this filter may take.
pub const ACTIONS: u32 = SMFIF_ADDHDRS | SMFIF_CHGHDRS;

/// Stages the MTA should not send.
pub const PROTOCOL_FLAGS: u32 =
    SMFIP_NOHELO | SMFIP_NOMAIL | SMFIP_NOHDRS | SMFIP_NOEOH | SMFIP_NOBODY;

/// Header index used for every header change.
pub const HEADER_INDEX: u32 = 1;

/// A response sent to the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Option negotiation reply.
    Negotiate {
        /// Protocol version.
        version: u32,
        /// Action flags.
        actions: u32,
        /// Protocol skip flags.
        protocol: u32,
    },
    /// Accept the message; no further callbacks.
    Accept,
    /// Continue to the next stage.
    Continue,
    /// Temporary failure.
    TempFail,
    /// Reject with an SMTP reply.
    ReplyCode {
        /// Three-digit SMTP code.
        code: u16,
        /// Reason text, optionally starting with an enhanced status code.
        text: String,
    },
    /// Change (or insert) a header.
    ChangeHeader {
        /// Header index.
        index: u32,
        /// Header name.
        name: String,
        /// Header value.
        value: String,
    },
}

impl Response {
    /// The option negotiation reply this filter sends.
    #[must_use]
    pub const fn negotiate() -> Self {
        Self::Negotiate {
            version: MILTER_VERSION,
            actions: ACTIONS,
            protocol: PROTOCOL_FLAGS,
        }
    }

    /// A header change at the fixed index.
    #[must_use]
    pub fn change_header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::ChangeHeader {
            index: HEADER_INDEX,
            name: name.into(),
            value: value.into(),
        }
    }

    /// Returns the response command byte.
    #[must_use]
    pub const fn command(&self) -> u8 {
        match self {
            Self::Negotiate { .. } => SMFIC_OPTNEG,
            Self::Accept => SMFIR_ACCEPT,
            Self::Continue => SMFIR_CONTINUE,
            Self::TempFail => SMFIR_TEMPFAIL,
            Self::ReplyCode { .. } => SMFIR_REPLYCODE,
            Self::ChangeHeader { .. } => SMFIR_CHGHEADER,
        }
    }

    /// Encodes the response as a packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        let mut payload = BytesMut::new();
        match self {
            Self::Negotiate {
                version,
                actions,
                protocol,
            } => {
                payload.put_u32(*version);
                payload.put_u32(*actions);
                payload.put_u32(*protocol);
            }
            Self::Accept | Self::Continue | Self::TempFail => {}
            Self::ReplyCode { code, text } => {
                payload.put_slice(format!("{code} {text}").as_bytes());
                payload.put_u8(0);
            }
            Self::ChangeHeader { index, name, value } => {
                payload.put_u32(*index);
                payload.put_slice(name.as_bytes());
                payload.put_u8(0);
                payload.put_slice(value.as_bytes());
                payload.put_u8(0);
            }
        }
        Packet::new(self.command(), payload.freeze())
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
    fn test_negotiate_packet() {
        let packet = Response::negotiate().to_packet();
        assert_eq!(packet.command, b'O');
        assert_eq!(
            &packet.payload[..],
            &[0, 0, 0, 2, 0, 0, 0, 0x11, 0, 0, 0, 0x76]
        );
    }

    #[test]
    fn test_simple_packets_have_no_payload() {
        for (response, command) in [
            (Response::Accept, b'a'),
            (Response::Continue, b'c'),
            (Response::TempFail, b't'),
        ] {
            let packet = response.to_packet();
            assert_eq!(packet.command, command);
            assert!(packet.payload.is_empty());
            assert_eq!(packet.wire_len(), 1);
        }
    }

    #[test]
    fn test_reply_code_packet() {
        let packet = Response::ReplyCode {
            code: 554,
            text: "5.7.1 denied".to_string(),
        }
        .to_packet();
        assert_eq!(packet.command, b'y');
        assert_eq!(&packet.payload[..], b"554 5.7.1 denied\0");
    }

    #[test]
    fn test_change_header_packet() {
        let packet = Response::change_header("X-Zimbra-DL", "a@b").to_packet();
        assert_eq!(packet.command, b'm');
        assert_eq!(&packet.payload[..], b"\x00\x00\x00\x01X-Zimbra-DL\0a@b\0");
    }
}
