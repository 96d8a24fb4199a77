//! Per-connection milter state.

use std::collections::HashMap;
use std::fmt;

use crate::directory::Group;
use crate::protocol::{SMFIC_CONNECT, SMFIC_MAIL, SMFIC_RCPT};
use crate::{Error, Result};

/// Macro carrying the envelope sender.
pub const MAIL_ADDR_MACRO: &str = "{mail_addr}";

/// Macro carrying the envelope recipient.
pub const RCPT_ADDR_MACRO: &str = "{rcpt_addr}";

/// HELO stage marker in macro packets.
const STAGE_HELO: u8 = b'H';

/// Protocol family of the SMTP client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Unknown; no port or address follows.
    Unknown,
    /// Unix domain socket.
    Unix,
    /// IPv4.
    Inet,
    /// IPv6.
    Inet6,
}

impl Family {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(Self::Unknown),
            b'L' => Some(Self::Unix),
            b'4' => Some(Self::Inet),
            b'6' => Some(Self::Inet6),
            _ => None,
        }
    }

    /// Returns the wire character.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Unknown => 'U',
            Self::Unix => 'L',
            Self::Inet => '4',
            Self::Inet6 => '6',
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Connection details from the `C` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Client hostname.
    pub hostname: String,
    /// Protocol family.
    pub family: Family,
    /// Client port; absent for the unknown family.
    pub port: Option<u16>,
    /// Client address or socket path; absent for the unknown family.
    pub address: Option<String>,
}

impl ConnectInfo {
    /// Parses a `C` payload: `hostname\0 family [port address\0]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is truncated or the family is unknown.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (hostname, rest) = split_cstr(payload)
            .ok_or_else(|| Error::malformed("connect", "hostname is not NUL-terminated"))?;
        let (&family, rest) = rest
            .split_first()
            .ok_or_else(|| Error::malformed("connect", "missing protocol family"))?;
        let family = Family::from_byte(family).ok_or_else(|| {
            Error::malformed("connect", format!("unknown protocol family {:?}", family as char))
        })?;

        if family == Family::Unknown {
            return Ok(Self {
                hostname,
                family,
                port: None,
                address: None,
            });
        }

        let Some((port, rest)) = rest.split_first_chunk::<2>() else {
            return Err(Error::malformed("connect", "missing port"));
        };
        let (address, _) = split_cstr(rest)
            .ok_or_else(|| Error::malformed("connect", "address is not NUL-terminated"))?;
        Ok(Self {
            hostname,
            family,
            port: Some(u16::from_be_bytes(*port)),
            address: Some(address),
        })
    }
}

/// Macros from one `D` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroSet {
    /// Command the macros belong to.
    pub stage: u8,
    /// Name/value pairs in arrival order.
    pub pairs: Vec<(String, String)>,
}

impl MacroSet {
    /// Parses a `D` payload: a stage byte followed by `name\0value\0` pairs.
    ///
    /// A trailing name without a value is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is empty.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (&stage, mut rest) = payload
            .split_first()
            .ok_or_else(|| Error::malformed("macro", "missing stage"))?;
        let mut pairs = Vec::new();
        while let Some((name, after_name)) = split_cstr(rest) {
            let Some((value, after_value)) = split_cstr(after_name) else {
                break;
            };
            pairs.push((name, value));
            rest = after_value;
        }
        Ok(Self { stage, pairs })
    }

    /// Returns the value of a macro.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Splits off a NUL-terminated string.
fn split_cstr(data: &[u8]) -> Option<(String, &[u8])> {
    let end = data.iter().position(|&b| b == 0)?;
    let text = String::from_utf8_lossy(&data[..end]).into_owned();
    Some((text, &data[end + 1..]))
}

/// Strips enclosing angle brackets and lower-cases an address.
#[must_use]
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);
    inner.trim().to_lowercase()
}

/// State of one milter connection.
///
/// Connection details and connect/HELO-stage macros live as long as the
/// connection. Message macros, the envelope and the matched groups are
/// per-message and go away on abort or end of body.
#[derive(Debug, Default)]
pub struct MilterContext {
    connect: Option<ConnectInfo>,
    connection_macros: HashMap<String, String>,
    message_macros: HashMap<String, String>,
    sender: Option<String>,
    recipient: Option<String>,
    groups: Vec<Group>,
}

impl MilterContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection details.
    #[must_use]
    pub const fn connect_info(&self) -> Option<&ConnectInfo> {
        self.connect.as_ref()
    }

    /// Records connection details.
    pub fn set_connect(&mut self, info: ConnectInfo) {
        self.connect = Some(info);
    }

    /// Stores a macro set. MAIL and RCPT stage sets update the envelope.
    pub fn define_macros(&mut self, set: MacroSet) {
        match set.stage {
            SMFIC_MAIL => {
                if let Some(addr) = set.get(MAIL_ADDR_MACRO) {
                    self.sender = Some(normalize_address(addr));
                }
            }
            SMFIC_RCPT => {
                if let Some(addr) = set.get(RCPT_ADDR_MACRO) {
                    self.recipient = Some(normalize_address(addr));
                }
            }
            _ => {}
        }
        let target = if matches!(set.stage, SMFIC_CONNECT | STAGE_HELO) {
            &mut self.connection_macros
        } else {
            &mut self.message_macros
        };
        target.extend(set.pairs);
    }

    /// Returns a macro value, preferring message macros.
    #[must_use]
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.message_macros
            .get(name)
            .or_else(|| self.connection_macros.get(name))
            .map(String::as_str)
    }

    /// Returns the normalized envelope sender.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Returns the normalized current recipient.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    /// Returns the groups matched for the current message, in match order.
    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Records a matched group. A group already recorded is not added twice.
    pub fn add_group(&mut self, group: Group) {
        if !self
            .groups
            .iter()
            .any(|g| g.mail.eq_ignore_ascii_case(&group.mail))
        {
            self.groups.push(group);
        }
    }

    /// Clears per-message state, keeping the connection details.
    pub fn reset_message(&mut self) {
        self.message_macros.clear();
        self.sender = None;
        self.recipient = None;
        self.groups.clear();
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
    fn test_parse_connect_inet() {
        let info = ConnectInfo::parse(b"mx.example.com\x004\x00\x19192.0.2.1\x00").unwrap();
        assert_eq!(info.hostname, "mx.example.com");
        assert_eq!(info.family, Family::Inet);
        assert_eq!(info.port, Some(25));
        assert_eq!(info.address.as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn test_parse_connect_unknown_family_has_no_address() {
        let info = ConnectInfo::parse(b"localhost\x00U").unwrap();
        assert_eq!(info.family, Family::Unknown);
        assert_eq!(info.port, None);
        assert_eq!(info.address, None);
    }

    #[test]
    fn test_parse_connect_errors() {
        assert!(ConnectInfo::parse(b"no-nul").is_err());
        assert!(ConnectInfo::parse(b"host\x00").is_err());
        assert!(ConnectInfo::parse(b"host\x00X").is_err());
        assert!(ConnectInfo::parse(b"host\x004\x00").is_err());
        assert!(ConnectInfo::parse(b"host\x004\x00\x19addr").is_err());
    }

    #[test]
    fn test_parse_macros() {
        let set = MacroSet::parse(b"Mi\x00ABC123\x00{mail_addr}\x00<Bob@Example.COM>\x00").unwrap();
        assert_eq!(set.stage, b'M');
        assert_eq!(set.get("i"), Some("ABC123"));
        assert_eq!(set.get(MAIL_ADDR_MACRO), Some("<Bob@Example.COM>"));
        assert!(MacroSet::parse(b"").is_err());

        let set = MacroSet::parse(b"Cj\x00").unwrap();
        assert!(set.pairs.is_empty());
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("<Bob@Example.COM>"), "bob@example.com");
        assert_eq!(normalize_address(" alice@example.com "), "alice@example.com");
        assert_eq!(normalize_address("<>"), "");
        assert_eq!(normalize_address("<unbalanced"), "<unbalanced");
    }

    #[test]
    fn test_envelope_from_macros() {
        let mut ctx = MilterContext::new();
        ctx.define_macros(MacroSet::parse(b"M{mail_addr}\x00<A@X.org>\x00").unwrap());
        ctx.define_macros(MacroSet::parse(b"R{rcpt_addr}\x00<List@X.org>\x00").unwrap());
        assert_eq!(ctx.sender(), Some("a@x.org"));
        assert_eq!(ctx.recipient(), Some("list@x.org"));
        assert_eq!(ctx.macro_value(RCPT_ADDR_MACRO), Some("<List@X.org>"));
    }

    #[test]
    fn test_reset_keeps_connection_state() {
        let mut ctx = MilterContext::new();
        ctx.set_connect(ConnectInfo::parse(b"host\x00U").unwrap());
        ctx.define_macros(MacroSet::parse(b"Cj\x00mta.example.com\x00").unwrap());
        ctx.define_macros(MacroSet::parse(b"M{mail_addr}\x00a@x\x00i\x00Q1\x00").unwrap());
        ctx.add_group(Group::new("dl@x"));

        ctx.reset_message();
        assert!(ctx.connect_info().is_some());
        assert_eq!(ctx.macro_value("j"), Some("mta.example.com"));
        assert_eq!(ctx.macro_value("i"), None);
        assert_eq!(ctx.sender(), None);
        assert!(ctx.groups().is_empty());
    }

    #[test]
    fn test_add_group_deduplicates() {
        let mut ctx = MilterContext::new();
        ctx.add_group(Group::new("dl@x"));
        ctx.add_group(Group::new("other@x"));
        ctx.add_group(Group::new("DL@x"));
        let mails: Vec<_> = ctx.groups().iter().map(|g| g.mail.as_str()).collect();
        assert_eq!(mails, vec!["dl@x", "other@x"]);
    }
}
