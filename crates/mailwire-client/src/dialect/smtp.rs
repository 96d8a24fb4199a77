//! SMTP dialect (RFC 5321, RFC 4954).

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

use crate::dialect::{Dialect, LoginStep, initial_response_arg};
use crate::reply::{Classified, Reply, Status};
use crate::{Error, MailConfig, MailConnection, Result, Security, State};

/// Mechanisms picked automatically when none is configured, in order of preference.
const AUTO_MECHANISMS: [&str; 4] = ["LOGIN", "PLAIN", "XOAUTH2", "OAUTHBEARER"];

/// Domain sent in EHLO/HELO when none is configured.
const DEFAULT_DOMAIN: &str = "localhost";

/// SMTP session details.
#[derive(Debug, Default)]
pub struct Smtp {
    extensions: HashMap<String, String>,
    mechanisms: Vec<String>,
}

impl Smtp {
    /// Returns true if the server advertised the extension in its EHLO reply.
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.extensions
            .contains_key(&extension.to_ascii_uppercase())
    }

    /// Returns the parameters of an advertised extension.
    #[must_use]
    pub fn extension(&self, extension: &str) -> Option<&str> {
        self.extensions
            .get(&extension.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Returns the advertised AUTH mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> &[String] {
        &self.mechanisms
    }
}

impl Dialect for Smtp {
    const NAME: &'static str = "SMTP";
    const SERVICE: &'static str = "smtp";

    fn default_port(security: Security) -> u16 {
        if security.is_implicit() { 465 } else { 25 }
    }

    fn classify(&self, _tag: Option<&str>, line: &str) -> Result<Classified> {
        let code = line
            .get(..3)
            .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| Error::Parse(format!("invalid reply code: {line}")))?;
        let separator = line.as_bytes().get(3).copied();
        let text = line.get(4..).unwrap_or_default().to_string();

        match separator {
            Some(b'-') => Ok(Classified::Data(text)),
            Some(b' ') | None => {
                let status = match code / 100 {
                    2 => Status::Ok,
                    3 => Status::Continue,
                    _ => Status::No,
                };
                Ok(Classified::Done {
                    status,
                    code: Some(code),
                    text,
                })
            }
            Some(_) => Err(Error::Parse(format!("malformed reply line: {line}"))),
        }
    }

    fn greeting(&mut self, reply: &Reply) -> Result<State> {
        if reply.code == Some(220) {
            Ok(State::NotAuthenticated)
        } else {
            Err(Error::Greeting(reply.lines().collect::<Vec<_>>().join(" ")))
        }
    }

    fn handshake(&self, config: &MailConfig) -> Vec<String> {
        let domain = config.domain.as_deref().unwrap_or(DEFAULT_DOMAIN);
        vec![format!("EHLO {domain}"), format!("HELO {domain}")]
    }

    fn record_handshake(&mut self, reply: &Reply) {
        self.extensions.clear();
        self.mechanisms.clear();
        // The first line names the server; extensions follow.
        for line in reply.lines().skip(1) {
            let (keyword, params) = line.split_once(' ').unwrap_or((line, ""));
            let keyword = keyword.to_ascii_uppercase();
            if keyword == "AUTH" {
                self.mechanisms = params
                    .split_whitespace()
                    .map(str::to_ascii_uppercase)
                    .collect();
            }
            self.extensions.insert(keyword, params.to_string());
        }
    }

    fn reset_after_tls(&mut self) {
        self.extensions.clear();
        self.mechanisms.clear();
    }

    fn starttls_command(&self) -> &'static str {
        "STARTTLS"
    }

    fn login_steps(&self, user: &str, password: &str) -> Vec<LoginStep> {
        vec![
            LoginStep::Command("AUTH LOGIN".to_string()),
            LoginStep::Respond(STANDARD.encode(user)),
            LoginStep::Respond(STANDARD.encode(password)),
        ]
    }

    fn authenticate_command(&self, mechanism: &str, initial_response: Option<&str>) -> String {
        match initial_response {
            Some(ir) => format!("AUTH {mechanism} {}", initial_response_arg(ir)),
            None => format!("AUTH {mechanism}"),
        }
    }

    fn preferred_mechanism(&self) -> Option<&'static str> {
        AUTO_MECHANISMS
            .into_iter()
            .find(|m| self.mechanisms.iter().any(|s| s == m))
    }

    fn logout_command(&self) -> &'static str {
        "QUIT"
    }
}

/// Outcome of a message submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Recipients the server accepted.
    pub valid_recipients: Vec<String>,
    /// Recipients the server rejected, with the server's reason.
    pub invalid_recipients: Vec<(String, String)>,
}

/// Normalises line endings to CRLF, byte-stuffs leading dots and appends the
/// terminating `.` line.
#[must_use]
pub fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 32 + 5);
    let body = message.strip_suffix(b"\n").unwrap_or(message);
    if !message.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
}

impl MailConnection<Smtp> {
    /// Submits a message.
    ///
    /// Rejected recipients are reported rather than failing the transaction;
    /// the message is sent if at least one recipient is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if MAIL or DATA is rejected, no recipient is
    /// accepted, or the connection fails.
    pub async fn send_message<R: AsRef<str>>(
        &mut self,
        sender: &str,
        recipients: &[R],
        message: &[u8],
    ) -> Result<SendReport> {
        self.check_state(&[State::NotAuthenticated, State::Authenticated])?;

        self.execute_ok(&format!("MAIL FROM:<{sender}>")).await?;

        let mut report = SendReport::default();
        for recipient in recipients {
            let recipient = recipient.as_ref();
            let reply = self.execute(&format!("RCPT TO:<{recipient}>")).await?;
            if reply.is_ok() {
                report.valid_recipients.push(recipient.to_string());
            } else {
                warn!(recipient, reason = %reply.text, "recipient rejected");
                report
                    .invalid_recipients
                    .push((recipient.to_string(), reply.text));
            }
        }

        if report.valid_recipients.is_empty() {
            if let Err(e) = self.execute_ok("RSET").await {
                warn!(error = %e, "RSET after rejected recipients failed");
            }
            return Err(Error::command("RCPT", "no valid recipients"));
        }

        let reply = self.execute("DATA").await?;
        if !reply.is_continuation() {
            return Err(Error::command("DATA", reply.text));
        }

        let reply = self.send_raw(&dot_stuff(message)).await?;
        if !reply.is_ok() {
            return Err(Error::command("DATA", reply.text));
        }
        Ok(report)
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

    fn reply_from(smtp: &Smtp, lines: &[&str]) -> Reply {
        let mut data = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            match smtp.classify(None, line).unwrap() {
                Classified::Data(text) => data.push(text),
                Classified::Done { status, code, text } => {
                    assert_eq!(i, lines.len() - 1);
                    return Reply {
                        status,
                        code,
                        text,
                        line: (*line).to_string(),
                        data,
                        literals: Vec::new(),
                    };
                }
            }
        }
        panic!("reply not complete");
    }

    #[test]
    fn test_classify_single_and_multi_line() {
        let smtp = Smtp::default();
        assert_eq!(
            smtp.classify(None, "250-PIPELINING").unwrap(),
            Classified::Data("PIPELINING".to_string())
        );
        assert_eq!(
            smtp.classify(None, "250 OK").unwrap(),
            Classified::Done {
                status: Status::Ok,
                code: Some(250),
                text: "OK".to_string()
            }
        );
        assert!(matches!(
            smtp.classify(None, "334 VXNlcm5hbWU6").unwrap(),
            Classified::Done {
                status: Status::Continue,
                code: Some(334),
                ..
            }
        ));
        assert!(matches!(
            smtp.classify(None, "535 5.7.8 bad credentials").unwrap(),
            Classified::Done {
                status: Status::No,
                ..
            }
        ));
        assert!(matches!(
            smtp.classify(None, "354").unwrap(),
            Classified::Done {
                status: Status::Continue,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_errors() {
        let smtp = Smtp::default();
        assert!(matches!(smtp.classify(None, "25"), Err(Error::Parse(_))));
        assert!(matches!(smtp.classify(None, "ABC OK"), Err(Error::Parse(_))));
        assert!(matches!(smtp.classify(None, "250_OK"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_multi_line_greeting() {
        let mut smtp = Smtp::default();
        let reply = reply_from(&smtp, &["220-smtp.example.com ESMTP", "220 ready"]);
        assert_eq!(smtp.greeting(&reply).unwrap(), State::NotAuthenticated);

        let reply = reply_from(&smtp, &["554 no service"]);
        assert!(matches!(smtp.greeting(&reply), Err(Error::Greeting(_))));
    }

    #[test]
    fn test_ehlo_extensions() {
        let mut smtp = Smtp::default();
        let reply = reply_from(
            &smtp,
            &[
                "250-smtp.example.com greets you",
                "250-SIZE 35882577",
                "250-STARTTLS",
                "250 AUTH PLAIN LOGIN XOAUTH2",
            ],
        );
        smtp.record_handshake(&reply);
        assert!(smtp.supports("starttls"));
        assert_eq!(smtp.extension("SIZE"), Some("35882577"));
        assert_eq!(smtp.auth_mechanisms(), &["PLAIN", "LOGIN", "XOAUTH2"]);
        assert_eq!(smtp.preferred_mechanism(), Some("LOGIN"));

        smtp.reset_after_tls();
        assert!(!smtp.supports("STARTTLS"));
        assert_eq!(smtp.preferred_mechanism(), None);
    }

    #[test]
    fn test_handshake_falls_back_to_helo() {
        let smtp = Smtp::default();
        let config = MailConfig::builder("h").domain("client.test").build().unwrap();
        assert_eq!(
            smtp.handshake(&config),
            vec!["EHLO client.test", "HELO client.test"]
        );
    }

    #[test]
    fn test_auth_login_steps() {
        let steps = Smtp::default().login_steps("user", "pass");
        assert_eq!(
            steps,
            vec![
                LoginStep::Command("AUTH LOGIN".to_string()),
                LoginStep::Respond("dXNlcg==".to_string()),
                LoginStep::Respond("cGFzcw==".to_string()),
            ]
        );
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(
            dot_stuff(b"Subject: hi\n\n.hidden\r\nend\n"),
            b"Subject: hi\r\n\r\n..hidden\r\nend\r\n.\r\n"
        );
        assert_eq!(dot_stuff(b"no newline"), b"no newline\r\n.\r\n");
        assert_eq!(dot_stuff(b""), b".\r\n");
    }
}
