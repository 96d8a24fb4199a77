//! IMAP4 dialect (RFC 9051).

use crate::dialect::{Dialect, LoginStep, Request, command_name, initial_response_arg};
use crate::reply::{Classified, Reply, Status};
use crate::tag::TagGenerator;
use crate::{Error, MailConfig, MailConnection, Result, Security, State};

/// IMAP session details.
#[derive(Debug, Default)]
pub struct Imap {
    tags: TagGenerator,
    capabilities: Vec<String>,
    selected: Option<String>,
}

impl Imap {
    /// Returns the capabilities advertised by the server.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Returns true if the server advertised the capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// Returns the SASL mechanisms advertised as `AUTH=` capabilities.
    pub fn auth_mechanisms(&self) -> impl Iterator<Item = &str> {
        self.capabilities
            .iter()
            .filter_map(|c| c.strip_prefix("AUTH="))
    }

    /// Returns the currently selected mailbox.
    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn set_capabilities(&mut self, list: &str) {
        self.capabilities = list
            .split_whitespace()
            .map(str::to_ascii_uppercase)
            .collect();
    }
}

/// Splits off the first space-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((word, rest)) => (word, rest),
        None => (s, ""),
    }
}

/// Extracts the contents of a `[CAPABILITY ...]` response code.
fn capability_code(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let inner = &text[start + 1..];
    let end = inner.find(']')?;
    let (name, list) = split_word(&inner[..end]);
    name.eq_ignore_ascii_case("CAPABILITY").then_some(list)
}

/// Returns true if the value cannot be sent as an atom or quoted string
/// and has to go out as a `{N}` literal.
#[must_use]
pub fn needs_literal(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'\0' | b'\r' | b'\n') || b >= 0x80)
}

/// Writes a string as an IMAP astring, quoting when needed.
///
/// Values for which [`needs_literal`] is true must be sent as literals instead.
#[must_use]
pub fn quote_astring(s: &str) -> String {
    if !s.is_empty() && !s.bytes().any(needs_quoting) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Returns true if the byte needs quoting.
const fn needs_quoting(b: u8) -> bool {
    matches!(b, b' ' | b'"' | b'\\' | b'(' | b')' | b'{' | b'%' | b'*') || b < 0x20 || b == 0x7F
}

impl Dialect for Imap {
    const NAME: &'static str = "IMAP";
    const SERVICE: &'static str = "imap";

    fn default_port(security: Security) -> u16 {
        if security.is_implicit() { 993 } else { 143 }
    }

    fn supports_literals() -> bool {
        true
    }

    fn request(&mut self, command: &str) -> Request {
        let tag = self.tags.next_tag();
        Request {
            name: command_name(command),
            line: format!("{tag} {command}"),
            tag: Some(tag),
        }
    }

    fn classify(&self, tag: Option<&str>, line: &str) -> Result<Classified> {
        if let Some(rest) = line.strip_prefix('+') {
            return Ok(Classified::Done {
                status: Status::Continue,
                code: None,
                text: rest.trim_start().to_string(),
            });
        }

        if let Some(rest) = line.strip_prefix("* ") {
            if tag.is_some() {
                return Ok(Classified::Data(rest.to_string()));
            }
            let (word, text) = split_word(rest);
            let status = match word.to_ascii_uppercase().as_str() {
                "OK" | "PREAUTH" => Status::Ok,
                "BYE" => Status::Bye,
                _ => return Err(Error::Parse(format!("unexpected greeting: {line}"))),
            };
            return Ok(Classified::Done {
                status,
                code: None,
                text: text.to_string(),
            });
        }

        let rest = tag
            .and_then(|t| line.strip_prefix(t))
            .and_then(|r| r.strip_prefix(' '))
            .ok_or_else(|| Error::Parse(format!("unexpected response: {line}")))?;
        let (word, text) = split_word(rest);
        let status = match word.to_ascii_uppercase().as_str() {
            "OK" => Status::Ok,
            "NO" => Status::No,
            "BAD" => Status::Bad,
            _ => return Err(Error::Parse(format!("invalid status: {line}"))),
        };
        Ok(Classified::Done {
            status,
            code: None,
            text: text.to_string(),
        })
    }

    fn greeting(&mut self, reply: &Reply) -> Result<State> {
        match reply.status {
            Status::Ok => {
                if let Some(list) = capability_code(&reply.text) {
                    self.set_capabilities(list);
                }
                let preauth = reply
                    .line
                    .get(2..)
                    .is_some_and(|s| split_word(s).0.eq_ignore_ascii_case("PREAUTH"));
                Ok(if preauth {
                    State::Authenticated
                } else {
                    State::NotAuthenticated
                })
            }
            _ => Err(Error::Greeting(reply.text.clone())),
        }
    }

    fn handshake(&self, _config: &MailConfig) -> Vec<String> {
        if self.capabilities.is_empty() {
            vec!["CAPABILITY".to_string()]
        } else {
            Vec::new()
        }
    }

    fn record_handshake(&mut self, reply: &Reply) {
        self.observe(reply);
    }

    fn observe(&mut self, reply: &Reply) {
        for line in &reply.data {
            let (word, list) = split_word(line);
            if word.eq_ignore_ascii_case("CAPABILITY") {
                self.set_capabilities(list);
            }
        }
        if let Some(list) = capability_code(&reply.text) {
            self.set_capabilities(list);
        }
    }

    fn reset_after_tls(&mut self) {
        self.capabilities.clear();
    }

    fn starttls_command(&self) -> &'static str {
        "STARTTLS"
    }

    fn login_steps(&self, user: &str, password: &str) -> Vec<LoginStep> {
        // Each literal ends the current line; the server's continuation
        // request is answered with the literal bytes and the rest of the command.
        let mut steps = Vec::new();
        let mut line = String::from("LOGIN");
        for arg in [user, password] {
            line.push(' ');
            if needs_literal(arg) {
                line.push_str(&format!("{{{}}}", arg.len()));
                let step = std::mem::replace(&mut line, arg.to_string());
                steps.push(if steps.is_empty() {
                    LoginStep::Command(step)
                } else {
                    LoginStep::Respond(step)
                });
            } else {
                line.push_str(&quote_astring(arg));
            }
        }
        steps.push(if steps.is_empty() {
            LoginStep::Command(line)
        } else {
            LoginStep::Respond(line)
        });
        steps
    }

    fn authenticate_command(&self, mechanism: &str, initial_response: Option<&str>) -> String {
        match initial_response {
            Some(ir) => format!("AUTHENTICATE {mechanism} {}", initial_response_arg(ir)),
            None => format!("AUTHENTICATE {mechanism}"),
        }
    }

    fn allows_initial_response(&self) -> bool {
        self.has_capability("SASL-IR")
    }

    fn logout_command(&self) -> &'static str {
        "LOGOUT"
    }
}

/// Status of a selected mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mailbox {
    /// Mailbox name.
    pub name: String,
    /// Number of messages.
    pub exists: u32,
    /// Number of recent messages.
    pub recent: u32,
    /// UIDVALIDITY value.
    pub uid_validity: Option<u32>,
    /// Predicted next UID.
    pub uid_next: Option<u32>,
    /// Flags defined for the mailbox.
    pub flags: Vec<String>,
    /// True if the mailbox was opened read-only.
    pub read_only: bool,
}

impl Mailbox {
    fn from_reply(name: &str, reply: &Reply) -> Self {
        let mut mailbox = Self {
            name: name.to_string(),
            read_only: reply.text.to_ascii_uppercase().contains("[READ-ONLY]"),
            ..Self::default()
        };
        for line in &reply.data {
            let (first, rest) = split_word(line);
            if let Ok(n) = first.parse::<u32>() {
                match rest.to_ascii_uppercase().as_str() {
                    "EXISTS" => mailbox.exists = n,
                    "RECENT" => mailbox.recent = n,
                    _ => {}
                }
            } else if first.eq_ignore_ascii_case("FLAGS") {
                mailbox.flags = rest
                    .trim_matches(|c| c == '(' || c == ')')
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
            } else if first.eq_ignore_ascii_case("OK") {
                if let Some(n) = response_code_number(rest, "UIDVALIDITY") {
                    mailbox.uid_validity = Some(n);
                }
                if let Some(n) = response_code_number(rest, "UIDNEXT") {
                    mailbox.uid_next = Some(n);
                }
            }
        }
        mailbox
    }
}

/// Parses `[NAME n]` from response text.
fn response_code_number(text: &str, name: &str) -> Option<u32> {
    let inner = text.strip_prefix('[')?;
    let (code, _) = inner.split_once(']')?;
    let (key, value) = split_word(code);
    if key.eq_ignore_ascii_case(name) {
        value.trim().parse().ok()
    } else {
        None
    }
}

impl MailConnection<Imap> {
    /// Selects a mailbox.
    ///
    /// A failed SELECT leaves no mailbox selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not authenticated or the server
    /// rejects the mailbox.
    pub async fn select(&mut self, mailbox: &str) -> Result<Mailbox> {
        self.check_state(&[State::Authenticated, State::Selected])?;
        let reply = self
            .execute(&format!("SELECT {}", quote_astring(mailbox)))
            .await?;
        if !reply.is_ok() {
            self.dialect.selected = None;
            self.set_state(State::Authenticated);
            return Err(Error::command("SELECT", reply.text));
        }
        self.dialect.selected = Some(mailbox.to_string());
        self.set_state(State::Selected);
        Ok(Mailbox::from_reply(mailbox, &reply))
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<()> {
        self.execute_ok("NOOP").await.map(|_| ())
    }

    /// Requests the capability list.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn capability(&mut self) -> Result<Vec<String>> {
        self.execute_ok("CAPABILITY").await?;
        Ok(self.dialect.capabilities.clone())
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

    fn done(status: Status, text: &str) -> Classified {
        Classified::Done {
            status,
            code: None,
            text: text.to_string(),
        }
    }

    fn reply(line: &str, status: Status, text: &str, data: &[&str]) -> Reply {
        Reply {
            status,
            code: None,
            text: text.to_string(),
            line: line.to_string(),
            data: data.iter().map(|s| (*s).to_string()).collect(),
            literals: Vec::new(),
        }
    }

    #[test]
    fn test_request_is_tagged() {
        let mut imap = Imap::default();
        let req = imap.request("NOOP");
        assert_eq!(req.tag.as_deref(), Some("A0001"));
        assert_eq!(req.line, "A0001 NOOP");
        assert_eq!(req.name, "NOOP");
        assert_eq!(imap.request("NOOP").line, "A0002 NOOP");
    }

    #[test]
    fn test_classify_tagged_lines() {
        let imap = Imap::default();
        let tag = Some("A0001");
        assert_eq!(
            imap.classify(tag, "* 3 EXISTS").unwrap(),
            Classified::Data("3 EXISTS".to_string())
        );
        assert_eq!(
            imap.classify(tag, "A0001 OK done").unwrap(),
            done(Status::Ok, "done")
        );
        assert_eq!(
            imap.classify(tag, "A0001 no [AUTHENTICATIONFAILED] nope").unwrap(),
            done(Status::No, "[AUTHENTICATIONFAILED] nope")
        );
        assert_eq!(
            imap.classify(tag, "A0001 BAD syntax").unwrap(),
            done(Status::Bad, "syntax")
        );
        assert_eq!(imap.classify(tag, "+ ").unwrap(), done(Status::Continue, ""));
        assert_eq!(
            imap.classify(tag, "+ dGVzdA==").unwrap(),
            done(Status::Continue, "dGVzdA==")
        );
    }

    #[test]
    fn test_classify_rejects_foreign_tag() {
        let imap = Imap::default();
        assert!(matches!(
            imap.classify(Some("A0002"), "A0001 OK done"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            imap.classify(Some("A0001"), "A0001 MAYBE"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_greeting_states() {
        let mut imap = Imap::default();
        let ok = imap.classify(None, "* OK [CAPABILITY IMAP4rev1 SASL-IR] hi");
        assert_eq!(
            ok.unwrap(),
            done(Status::Ok, "[CAPABILITY IMAP4rev1 SASL-IR] hi")
        );

        let r = reply(
            "* OK [CAPABILITY IMAP4rev1 SASL-IR] hi",
            Status::Ok,
            "[CAPABILITY IMAP4rev1 SASL-IR] hi",
            &[],
        );
        assert_eq!(imap.greeting(&r).unwrap(), State::NotAuthenticated);
        assert!(imap.has_capability("sasl-ir"));
        assert!(imap.handshake(&MailConfig::builder("h").build().unwrap()).is_empty());

        let r = reply("* PREAUTH welcome back", Status::Ok, "welcome back", &[]);
        assert_eq!(imap.greeting(&r).unwrap(), State::Authenticated);

        let r = reply("* BYE too busy", Status::Bye, "too busy", &[]);
        assert!(matches!(imap.greeting(&r), Err(Error::Greeting(t)) if t == "too busy"));
    }

    #[test]
    fn test_capability_data_line() {
        let mut imap = Imap::default();
        let r = reply(
            "A0001 OK done",
            Status::Ok,
            "done",
            &["CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN AUTH=XOAUTH2"],
        );
        imap.observe(&r);
        assert!(imap.has_capability("STARTTLS"));
        assert_eq!(
            imap.auth_mechanisms().collect::<Vec<_>>(),
            vec!["PLAIN", "XOAUTH2"]
        );
        imap.reset_after_tls();
        assert!(imap.capabilities().is_empty());
    }

    #[test]
    fn test_login_quoting() {
        let imap = Imap::default();
        let steps = imap.login_steps("user@example.com", "pa ss\"word");
        assert_eq!(
            steps,
            vec![LoginStep::Command(
                "LOGIN user@example.com \"pa ss\\\"word\"".to_string()
            )]
        );
        assert_eq!(quote_astring(""), "\"\"");
    }

    #[test]
    fn test_login_sends_unquotable_values_as_literals() {
        let imap = Imap::default();
        let steps = imap.login_steps("user@example.com", "line\r\nbreak");
        assert_eq!(
            steps,
            vec![
                LoginStep::Command("LOGIN user@example.com {11}".to_string()),
                LoginStep::Respond("line\r\nbreak".to_string()),
            ]
        );

        let steps = imap.login_steps("j\u{f6}rg", "p\0w");
        assert_eq!(
            steps,
            vec![
                LoginStep::Command("LOGIN {5}".to_string()),
                LoginStep::Respond("j\u{f6}rg {3}".to_string()),
                LoginStep::Respond("p\0w".to_string()),
            ]
        );
        assert!(!needs_literal("pa ss\"word"));
    }

    #[test]
    fn test_authenticate_command() {
        let imap = Imap::default();
        assert_eq!(
            imap.authenticate_command("PLAIN", None),
            "AUTHENTICATE PLAIN"
        );
        assert_eq!(
            imap.authenticate_command("EXTERNAL", Some("")),
            "AUTHENTICATE EXTERNAL ="
        );
        assert!(!imap.allows_initial_response());
    }

    #[test]
    fn test_mailbox_from_select_reply() {
        let r = reply(
            "A0002 OK [READ-WRITE] SELECT completed",
            Status::Ok,
            "[READ-WRITE] SELECT completed",
            &[
                "FLAGS (\\Answered \\Seen)",
                "17 EXISTS",
                "2 RECENT",
                "OK [UIDVALIDITY 3857529045] UIDs valid",
                "OK [UIDNEXT 4392] Predicted next UID",
            ],
        );
        let mailbox = Mailbox::from_reply("INBOX", &r);
        assert_eq!(mailbox.exists, 17);
        assert_eq!(mailbox.recent, 2);
        assert_eq!(mailbox.uid_validity, Some(3857529045));
        assert_eq!(mailbox.uid_next, Some(4392));
        assert_eq!(mailbox.flags, vec!["\\Answered", "\\Seen"]);
        assert!(!mailbox.read_only);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Imap::default_port(Security::Ssl), 993);
        assert_eq!(Imap::default_port(Security::Tls), 143);
        assert_eq!(Imap::default_port(Security::None), 143);
    }
}
