//! Milter command dispatcher.

use std::sync::Arc;

use mailwire_codec::Packet;
use tracing::{debug, trace, warn};

use crate::context::{ConnectInfo, MacroSet, MilterContext};
use crate::directory::{Directory, Group};
use crate::protocol::{
    Response, SMFIC_ABORT, SMFIC_BODYEOB, SMFIC_CONNECT, SMFIC_HEADER, SMFIC_MACRO, SMFIC_MAIL,
    SMFIC_OPTNEG, SMFIC_QUIT, SMFIC_RCPT,
};

/// Header listing the groups a message was sent through.
pub const LIST_HEADER: &str = "X-Zimbra-DL";

/// Reply-To header.
pub const REPLY_TO_HEADER: &str = "Reply-To";

/// SMTP code for a denied group posting.
const DENIED_CODE: u16 = 554;

/// What the connection should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send these responses, in order.
    Reply(Vec<Response>),
    /// Send nothing.
    NoReply,
    /// Close the connection.
    Quit,
}

impl Outcome {
    fn one(response: Response) -> Self {
        Self::Reply(vec![response])
    }
}

/// Dispatches milter commands for one connection.
pub struct MilterHandler {
    directory: Arc<dyn Directory>,
    context: MilterContext,
}

impl std::fmt::Debug for MilterHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilterHandler")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl MilterHandler {
    /// Creates a handler with a fresh context.
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            context: MilterContext::new(),
        }
    }

    /// Returns the connection context.
    #[must_use]
    pub const fn context(&self) -> &MilterContext {
        &self.context
    }

    /// Handles one command packet.
    pub fn handle(&mut self, packet: &Packet) -> Outcome {
        trace!(
            command = %char::from(packet.command),
            len = packet.payload.len(),
            "milter command"
        );
        match packet.command {
            SMFIC_OPTNEG => Outcome::one(Response::negotiate()),
            SMFIC_MACRO => {
                self.on_macro(&packet.payload);
                Outcome::NoReply
            }
            SMFIC_CONNECT => {
                self.on_connect(&packet.payload);
                Outcome::one(Response::Continue)
            }
            SMFIC_MAIL => Outcome::one(Response::Continue),
            SMFIC_RCPT => Outcome::one(self.on_rcpt()),
            // Headers are never inspected; accepting skips straight to end of message.
            SMFIC_HEADER => Outcome::one(Response::Accept),
            SMFIC_BODYEOB => Outcome::Reply(self.on_end_of_body()),
            SMFIC_ABORT => {
                self.context.reset_message();
                Outcome::NoReply
            }
            SMFIC_QUIT => Outcome::Quit,
            other => {
                debug!(command = %char::from(other), "unhandled milter command");
                Outcome::one(Response::Continue)
            }
        }
    }

    fn on_macro(&mut self, payload: &[u8]) {
        match MacroSet::parse(payload) {
            Ok(set) => self.context.define_macros(set),
            Err(e) => warn!(error = %e, "ignoring macro command"),
        }
    }

    fn on_connect(&mut self, payload: &[u8]) {
        match ConnectInfo::parse(payload) {
            Ok(info) => {
                debug!(
                    hostname = %info.hostname,
                    family = %info.family,
                    port = ?info.port,
                    address = ?info.address,
                    "milter connect"
                );
                self.context.set_connect(info);
            }
            Err(e) => warn!(error = %e, "ignoring connect command"),
        }
    }

    fn on_rcpt(&mut self) -> Response {
        let (Some(sender), Some(recipient)) = (self.context.sender(), self.context.recipient())
        else {
            debug!("recipient without sender or recipient macro");
            return Response::TempFail;
        };
        let sender = sender.to_string();
        let recipient = recipient.to_string();

        let group = match self.directory.resolve_group(&recipient) {
            Ok(Some(group)) => group,
            Ok(None) => return Response::Continue,
            Err(e) => {
                warn!(%recipient, error = %e, "group lookup failed");
                return Response::TempFail;
            }
        };

        match self.directory.can_send_to_group(&sender, &group) {
            Ok(true) => {
                debug!(%sender, group = %group.mail, "group posting allowed");
                self.context.add_group(group);
                Response::Continue
            }
            Ok(false) => {
                debug!(%sender, group = %group.mail, "group posting denied");
                Response::ReplyCode {
                    code: DENIED_CODE,
                    text: format!(
                        "5.7.1 Sender is not allowed to email this distribution list: {recipient}"
                    ),
                }
            }
            Err(e) => {
                warn!(%sender, group = %group.mail, error = %e, "access check failed");
                Response::TempFail
            }
        }
    }

    fn on_end_of_body(&mut self) -> Vec<Response> {
        let (lists, reply_tos) = header_values(self.context.groups());
        let mut responses = Vec::with_capacity(3);
        if !lists.is_empty() {
            responses.push(Response::change_header(LIST_HEADER, lists.join(", ")));
        }
        if !reply_tos.is_empty() {
            responses.push(Response::change_header(REPLY_TO_HEADER, reply_tos.join(", ")));
        }
        responses.push(Response::Accept);
        self.context.reset_message();
        responses
    }
}

/// Collects list addresses and reply-to mailboxes, each deduplicated in match order.
fn header_values(groups: &[Group]) -> (Vec<String>, Vec<String>) {
    let mut lists: Vec<String> = Vec::new();
    let mut reply_tos: Vec<String> = Vec::new();
    for group in groups {
        if !lists.contains(&group.mail) {
            lists.push(group.mail.clone());
        }
        let reply_to = group.reply_to();
        if !reply_tos.contains(&reply_to) {
            reply_tos.push(reply_to);
        }
    }
    (lists, reply_tos)
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
    use crate::directory::{GroupEntry, StaticDirectory};
    use crate::{Error, GroupResolver, AccessPolicy, Result};

    fn directory() -> Arc<dyn Directory> {
        Arc::new(StaticDirectory::new([
            GroupEntry {
                group: Group::new("eng@example.com")
                    .with_display_name("Engineering")
                    .with_reply_to("eng-owner@example.com", "Eng Owners"),
                allowed_senders: vec![],
            },
            GroupEntry {
                group: Group::new("all@example.com").with_display_name("Everyone"),
                allowed_senders: vec![],
            },
            GroupEntry {
                group: Group::new("board@example.com"),
                allowed_senders: vec!["ceo@example.com".to_string()],
            },
        ]))
    }

    fn macro_packet(stage: u8, name: &str, value: &str) -> Packet {
        let mut payload = vec![stage];
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        Packet::new(b'D', payload)
    }

    fn envelope(handler: &mut MilterHandler, sender: &str, rcpt: &str) -> Outcome {
        assert_eq!(
            handler.handle(&macro_packet(b'M', "{mail_addr}", sender)),
            Outcome::NoReply
        );
        assert_eq!(
            handler.handle(&macro_packet(b'R', "{rcpt_addr}", rcpt)),
            Outcome::NoReply
        );
        handler.handle(&Packet::bare(b'R'))
    }

    #[test]
    fn test_option_negotiation() {
        let mut handler = MilterHandler::new(directory());
        assert_eq!(
            handler.handle(&Packet::new(b'O', vec![0; 12])),
            Outcome::Reply(vec![Response::negotiate()])
        );
    }

    #[test]
    fn test_fixed_replies() {
        let mut handler = MilterHandler::new(directory());
        assert_eq!(
            handler.handle(&Packet::bare(b'M')),
            Outcome::Reply(vec![Response::Continue])
        );
        assert_eq!(
            handler.handle(&Packet::new(b'L', &b"Subject\0hi\0"[..])),
            Outcome::Reply(vec![Response::Accept])
        );
        assert_eq!(
            handler.handle(&Packet::bare(b'Z')),
            Outcome::Reply(vec![Response::Continue])
        );
        assert_eq!(handler.handle(&Packet::bare(b'Q')), Outcome::Quit);
    }

    #[test]
    fn test_connect_always_continues() {
        let mut handler = MilterHandler::new(directory());
        let outcome = handler.handle(&Packet::new(b'C', &b"mx\x004\x00\x19192.0.2.7\x00"[..]));
        assert_eq!(outcome, Outcome::Reply(vec![Response::Continue]));
        assert_eq!(handler.context().connect_info().unwrap().port, Some(25));

        let outcome = handler.handle(&Packet::new(b'C', &b"garbage"[..]));
        assert_eq!(outcome, Outcome::Reply(vec![Response::Continue]));
    }

    #[test]
    fn test_rcpt_without_sender_is_tempfail() {
        let mut handler = MilterHandler::new(directory());
        assert_eq!(
            handler.handle(&Packet::bare(b'R')),
            Outcome::Reply(vec![Response::TempFail])
        );
        handler.handle(&macro_packet(b'R', "{rcpt_addr}", "<eng@example.com>"));
        assert_eq!(
            handler.handle(&Packet::bare(b'R')),
            Outcome::Reply(vec![Response::TempFail])
        );
    }

    #[test]
    fn test_rcpt_denied_is_not_matched() {
        let mut handler = MilterHandler::new(directory());
        let outcome = envelope(&mut handler, "<Intern@Example.com>", "<Board@Example.com>");
        assert_eq!(
            outcome,
            Outcome::Reply(vec![Response::ReplyCode {
                code: 554,
                text: "5.7.1 Sender is not allowed to email this distribution list: board@example.com"
                    .to_string()
            }])
        );
        assert!(handler.context().groups().is_empty());
    }

    #[test]
    fn test_rcpt_allowed_is_matched() {
        let mut handler = MilterHandler::new(directory());
        let outcome = envelope(&mut handler, "<ceo@example.com>", "<board@example.com>");
        assert_eq!(outcome, Outcome::Reply(vec![Response::Continue]));
        assert_eq!(handler.context().groups().len(), 1);
    }

    #[test]
    fn test_rcpt_plain_user_continues() {
        let mut handler = MilterHandler::new(directory());
        let outcome = envelope(&mut handler, "a@example.com", "bob@example.com");
        assert_eq!(outcome, Outcome::Reply(vec![Response::Continue]));
        assert!(handler.context().groups().is_empty());
    }

    #[test]
    fn test_end_of_body_headers() {
        let mut handler = MilterHandler::new(directory());
        envelope(&mut handler, "a@example.com", "eng@example.com");
        handler.handle(&macro_packet(b'R', "{rcpt_addr}", "<all@example.com>"));
        handler.handle(&Packet::bare(b'R'));
        handler.handle(&macro_packet(b'R', "{rcpt_addr}", "<eng@example.com>"));
        handler.handle(&Packet::bare(b'R'));

        let outcome = handler.handle(&Packet::bare(b'E'));
        assert_eq!(
            outcome,
            Outcome::Reply(vec![
                Response::change_header("X-Zimbra-DL", "eng@example.com, all@example.com"),
                Response::change_header(
                    "Reply-To",
                    "Eng Owners <eng-owner@example.com>, Everyone <all@example.com>"
                ),
                Response::Accept,
            ])
        );
        assert!(handler.context().groups().is_empty());
    }

    #[test]
    fn test_end_of_body_without_groups_accepts() {
        let mut handler = MilterHandler::new(directory());
        assert_eq!(
            handler.handle(&Packet::bare(b'E')),
            Outcome::Reply(vec![Response::Accept])
        );
    }

    #[test]
    fn test_abort_keeps_connection_context() {
        let mut handler = MilterHandler::new(directory());
        handler.handle(&Packet::new(b'C', &b"mx\x00U"[..]));
        envelope(&mut handler, "a@example.com", "eng@example.com");
        assert_eq!(handler.context().groups().len(), 1);

        assert_eq!(handler.handle(&Packet::bare(b'A')), Outcome::NoReply);
        assert!(handler.context().groups().is_empty());
        assert_eq!(handler.context().sender(), None);
        assert!(handler.context().connect_info().is_some());
    }

    struct Broken;

    impl GroupResolver for Broken {
        fn resolve_group(&self, _address: &str) -> Result<Option<Group>> {
            Err(Error::Directory("unreachable".into()))
        }
    }

    impl AccessPolicy for Broken {
        fn can_send_to_group(&self, _sender: &str, _group: &Group) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_directory_failure_is_tempfail() {
        let mut handler = MilterHandler::new(Arc::new(Broken));
        let outcome = envelope(&mut handler, "a@example.com", "eng@example.com");
        assert_eq!(outcome, Outcome::Reply(vec![Response::TempFail]));
    }
}
