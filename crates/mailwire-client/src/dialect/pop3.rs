//! POP3 dialect (RFC 1939, RFC 2595, RFC 5034).

use crate::dialect::{Dialect, LoginStep, initial_response_arg};
use crate::reply::{Classified, Reply, Status};
use crate::{Error, Result, Security, State};

/// POP3 session details.
#[derive(Debug, Default)]
pub struct Pop3;

impl Dialect for Pop3 {
    const NAME: &'static str = "POP3";
    const SERVICE: &'static str = "pop";

    fn default_port(security: Security) -> u16 {
        if security.is_implicit() { 995 } else { 110 }
    }

    fn classify(&self, _tag: Option<&str>, line: &str) -> Result<Classified> {
        let (status, text) = if let Some(rest) = line.strip_prefix("+OK") {
            (Status::Ok, rest)
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            (Status::No, rest)
        } else if let Some(rest) = line.strip_prefix('+') {
            (Status::Continue, rest)
        } else {
            return Err(Error::Parse(format!("unexpected response: {line}")));
        };
        Ok(Classified::Done {
            status,
            code: None,
            text: text.trim_start().to_string(),
        })
    }

    fn greeting(&mut self, reply: &Reply) -> Result<State> {
        if reply.is_ok() {
            Ok(State::NotAuthenticated)
        } else {
            Err(Error::Greeting(reply.text.clone()))
        }
    }

    fn starttls_command(&self) -> &'static str {
        "STLS"
    }

    fn login_steps(&self, user: &str, password: &str) -> Vec<LoginStep> {
        vec![
            LoginStep::Command(format!("USER {user}")),
            LoginStep::Command(format!("PASS {password}")),
        ]
    }

    fn authenticate_command(&self, mechanism: &str, initial_response: Option<&str>) -> String {
        match initial_response {
            Some(ir) => format!("AUTH {mechanism} {}", initial_response_arg(ir)),
            None => format!("AUTH {mechanism}"),
        }
    }

    fn logout_command(&self) -> &'static str {
        "QUIT"
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
    fn test_classify() {
        let pop = Pop3;
        assert_eq!(
            pop.classify(None, "+OK POP3 ready").unwrap(),
            Classified::Done {
                status: Status::Ok,
                code: None,
                text: "POP3 ready".to_string()
            }
        );
        assert!(matches!(
            pop.classify(None, "-ERR denied").unwrap(),
            Classified::Done {
                status: Status::No,
                ..
            }
        ));
        assert!(matches!(
            pop.classify(None, "+ ").unwrap(),
            Classified::Done {
                status: Status::Continue,
                ..
            }
        ));
        assert!(matches!(pop.classify(None, "hello"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_login_steps() {
        let steps = Pop3.login_steps("user", "secret");
        assert_eq!(
            steps,
            vec![
                LoginStep::Command("USER user".to_string()),
                LoginStep::Command("PASS secret".to_string()),
            ]
        );
    }

    #[test]
    fn test_commands() {
        assert_eq!(Pop3.starttls_command(), "STLS");
        assert_eq!(Pop3.logout_command(), "QUIT");
        assert_eq!(
            Pop3.authenticate_command("PLAIN", Some("AHUAcA==")),
            "AUTH PLAIN AHUAcA=="
        );
        assert_eq!(Pop3::default_port(Security::Ssl), 995);
        assert_eq!(Pop3::default_port(Security::TlsIfAvailable), 110);
    }
}
