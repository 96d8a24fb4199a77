//! Milter listener glue for the server framework.

use std::sync::Arc;

use bytes::BytesMut;
use mailwire_codec::{Packet, PacketCodec};
use mailwire_server::{Handler, HandlerFactory, Server, ServerConfig, Session, SessionInfo, TlsContext};
use tokio_util::codec::Encoder;
use tracing::debug;

use crate::directory::Directory;
use crate::handler::{MilterHandler, Outcome};
use crate::Result;

/// Protocol name of milter sessions.
pub const PROTOCOL: &str = "milter";

/// Creates a [`MilterSession`] per MTA connection, all sharing one directory.
#[derive(Clone)]
pub struct MilterService {
    directory: Arc<dyn Directory>,
}

impl std::fmt::Debug for MilterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilterService").finish_non_exhaustive()
    }
}

impl MilterService {
    /// Creates the service.
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Binds a milter listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the bind fails.
    pub async fn bind(
        self,
        config: ServerConfig,
        tls: Option<Arc<TlsContext>>,
    ) -> Result<Server<Self>> {
        Ok(Server::bind(config, self, tls).await?)
    }
}

impl HandlerFactory for MilterService {
    type Handler = MilterSession;

    fn name(&self) -> &str {
        PROTOCOL
    }

    fn create(&self, _session: &Session) -> MilterSession {
        MilterSession {
            handler: MilterHandler::new(Arc::clone(&self.directory)),
            encoder: PacketCodec::default(),
        }
    }
}

/// One MTA connection.
#[derive(Debug)]
pub struct MilterSession {
    handler: MilterHandler,
    encoder: PacketCodec,
}

impl Handler for MilterSession {
    type Decoder = PacketCodec;

    fn decoder(&self, config: &ServerConfig) -> PacketCodec {
        PacketCodec::new(config.max_packet_size)
    }

    fn on_frame(&mut self, packet: Packet, session: &mut Session) -> mailwire_server::Result<()> {
        match self.handler.handle(&packet) {
            Outcome::Reply(responses) => {
                let mut out = BytesMut::new();
                for response in &responses {
                    self.encoder.encode(response.to_packet(), &mut out)?;
                }
                session.write(&out);
            }
            Outcome::NoReply => {}
            Outcome::Quit => session.close(),
        }
        Ok(())
    }

    fn on_close(&mut self, info: &SessionInfo) {
        debug!(
            session = %info.id(),
            commands = info.frames(),
            "milter session closed"
        );
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
    use mailwire_server::SessionId;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::directory::StaticDirectory;
    use crate::protocol::{SMFIC_OPTNEG, SMFIC_QUIT, SMFIR_ACCEPT, SMFIR_CONTINUE};

    fn session() -> Session {
        let info = SessionInfo::new(
            SessionId(1),
            PROTOCOL,
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:7025".parse().unwrap(),
        );
        Session::new(Arc::new(info), false)
    }

    fn decode_all(mut out: BytesMut) -> Vec<Packet> {
        let mut codec = PacketCodec::default();
        let mut packets = Vec::new();
        while let Some(packet) = codec.decode(&mut out).unwrap() {
            packets.push(packet);
        }
        packets
    }

    fn milter_session() -> MilterSession {
        MilterService::new(Arc::new(StaticDirectory::new([]))).create(&session())
    }

    #[test]
    fn test_negotiation_is_written_as_one_packet() {
        let mut milter = milter_session();
        let mut session = session();
        milter
            .on_frame(Packet::new(SMFIC_OPTNEG, vec![0u8; 12]), &mut session)
            .unwrap();
        let packets = decode_all(session.take_output());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].command, SMFIC_OPTNEG);
        assert_eq!(packets[0].payload.len(), 12);
    }

    #[test]
    fn test_end_of_body_without_groups_accepts() {
        let mut milter = milter_session();
        let mut session = session();
        milter.on_frame(Packet::bare(b'M'), &mut session).unwrap();
        milter.on_frame(Packet::bare(b'E'), &mut session).unwrap();
        let commands: Vec<u8> = decode_all(session.take_output())
            .iter()
            .map(|p| p.command)
            .collect();
        assert_eq!(commands, vec![SMFIR_CONTINUE, SMFIR_ACCEPT]);
    }

    #[test]
    fn test_quit_closes_without_reply() {
        let mut milter = milter_session();
        let mut session = session();
        milter.on_frame(Packet::bare(SMFIC_QUIT), &mut session).unwrap();
        assert!(session.is_closing());
        assert_eq!(session.pending(), 0);
    }
}
