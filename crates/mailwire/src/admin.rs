//! Line-oriented admin channel.
//!
//! ```text
//! S: OK mailwire admin
//! C: STATUS
//! S: id=1
//! S: protocol=milter
//! S: ...
//! S:
//! S: id=2
//! S: ...
//! S: .
//! C: FLUSH CACHE
//! S: OK flushed 12
//! C: QUIT
//! S: OK bye
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use mailwire_codec::{DecodeError, Frame, LineDecoder};
use mailwire_milter::{CachedDirectory, StaticDirectory};
use mailwire_server::{
    Handler, HandlerFactory, ServerConfig, Session, SessionInfo, SessionRegistry,
};

/// Protocol name of admin sessions.
pub const PROTOCOL: &str = "admin";

/// Greeting sent on connect.
pub const GREETING: &str = "OK mailwire admin";

/// Line that ends a `STATUS` listing.
pub const END_OF_LISTING: &str = ".";

/// State the admin commands act on.
#[derive(Debug)]
pub struct AdminState {
    registries: RwLock<Vec<SessionRegistry>>,
    directory: Arc<CachedDirectory<StaticDirectory>>,
}

impl AdminState {
    pub fn new(directory: Arc<CachedDirectory<StaticDirectory>>) -> Self {
        Self {
            registries: RwLock::new(Vec::new()),
            directory,
        }
    }

    /// Adds a listener whose sessions `STATUS` reports.
    pub fn watch(&self, registry: SessionRegistry) {
        self.registries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registry);
    }

    fn sessions(&self) -> Vec<Arc<SessionInfo>> {
        self.registries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(SessionRegistry::snapshot)
            .collect()
    }
}

/// Admin listener factory.
#[derive(Debug, Clone)]
pub struct AdminService {
    state: Arc<AdminState>,
}

impl AdminService {
    pub const fn new(state: Arc<AdminState>) -> Self {
        Self { state }
    }
}

impl HandlerFactory for AdminService {
    type Handler = AdminSession;

    fn name(&self) -> &str {
        PROTOCOL
    }

    fn create(&self, _session: &Session) -> AdminSession {
        AdminSession {
            state: Arc::clone(&self.state),
        }
    }
}

/// One admin connection.
#[derive(Debug)]
pub struct AdminSession {
    state: Arc<AdminState>,
}

impl AdminSession {
    fn status(&self, session: &mut Session) {
        for (i, info) in self.state.sessions().iter().enumerate() {
            if i > 0 {
                session.write_line("");
            }
            for (key, value) in info.to_record() {
                session.write_line(&format!("{key}={value}"));
            }
        }
        session.write_line(END_OF_LISTING);
    }
}

impl Handler for AdminSession {
    type Decoder = LineDecoder;

    fn decoder(&self, config: &ServerConfig) -> LineDecoder {
        LineDecoder::new(config.max_line_length, config.max_literal_size).without_literals()
    }

    fn on_open(&mut self, session: &mut Session) -> mailwire_server::Result<()> {
        session.write_line(GREETING);
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, session: &mut Session) -> mailwire_server::Result<()> {
        let Frame::Line(line) = frame else {
            return Ok(());
        };
        let words: Vec<String> = line
            .split_whitespace()
            .map(str::to_ascii_uppercase)
            .collect();
        match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            [] => {}
            ["STATUS"] => self.status(session),
            ["FLUSH", "CACHE"] => {
                let flushed = self.state.directory.invalidate();
                session.write_line(&format!("OK flushed {flushed}"));
            }
            ["QUIT"] => {
                session.write_line("OK bye");
                session.close();
            }
            _ => session.write_line(&format!("ERR unknown command: {}", line.trim())),
        }
        Ok(())
    }

    fn on_decode_error(&mut self, error: &DecodeError, session: &mut Session) {
        session.write_line(&format!("ERR {error}"));
    }

    fn on_idle(&mut self, session: &mut Session) {
        session.write_line("ERR idle timeout, closing");
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
    use mailwire_milter::{Group, GroupEntry, GroupResolver};
    use mailwire_server::{SessionId, parse_records};

    use super::*;

    fn state() -> Arc<AdminState> {
        let directory = StaticDirectory::new([GroupEntry {
            group: Group::new("staff@example.com"),
            allowed_senders: Vec::new(),
        }]);
        Arc::new(AdminState::new(Arc::new(CachedDirectory::new(directory))))
    }

    fn session() -> Session {
        let info = SessionInfo::new(
            SessionId(99),
            PROTOCOL,
            "127.0.0.1:4000".parse().unwrap(),
            "127.0.0.1:7027".parse().unwrap(),
        );
        Session::new(Arc::new(info), false)
    }

    fn run(admin: &mut AdminSession, session: &mut Session, line: &str) -> String {
        admin.on_frame(Frame::Line(line.into()), session).unwrap();
        String::from_utf8(session.take_output().to_vec()).unwrap()
    }

    #[test]
    fn test_status_lists_watched_sessions() {
        let state = state();
        let registry = SessionRegistry::new(4);
        let _a = registry
            .try_register("milter", "10.0.0.1:1".parse().unwrap(), "127.0.0.1:7026".parse().unwrap())
            .unwrap();
        let _b = registry
            .try_register("milter", "10.0.0.2:2".parse().unwrap(), "127.0.0.1:7026".parse().unwrap())
            .unwrap();
        state.watch(registry);

        let mut admin = AdminService::new(state).create(&session());
        let mut session = session();
        let out = run(&mut admin, &mut session, "status");
        assert!(out.ends_with("\r\n.\r\n"));

        let mut peers = Vec::new();
        let n = parse_records(&out, "id", |r| peers.push(r.get("peer").unwrap().to_string()));
        assert_eq!(n, 2);
        assert_eq!(peers, vec!["10.0.0.1:1", "10.0.0.2:2"]);
    }

    #[test]
    fn test_status_with_no_sessions() {
        let mut admin = AdminService::new(state()).create(&session());
        let mut session = session();
        assert_eq!(run(&mut admin, &mut session, "STATUS"), ".\r\n");
    }

    #[test]
    fn test_flush_cache() {
        let state = state();
        state.directory.resolve_group("staff@example.com").unwrap();
        state.directory.resolve_group("other@example.com").unwrap();

        let mut admin = AdminService::new(Arc::clone(&state)).create(&session());
        let mut session = session();
        assert_eq!(run(&mut admin, &mut session, "flush  cache"), "OK flushed 2\r\n");
        assert_eq!(state.directory.cached(), 0);
    }

    #[test]
    fn test_quit_and_unknown() {
        let mut admin = AdminService::new(state()).create(&session());
        let mut session = session();
        assert_eq!(
            run(&mut admin, &mut session, "REBOOT now"),
            "ERR unknown command: REBOOT now\r\n"
        );
        assert!(!session.is_closing());
        assert_eq!(run(&mut admin, &mut session, "QUIT"), "OK bye\r\n");
        assert!(session.is_closing());
    }

    #[test]
    fn test_idle_banner() {
        let mut admin = AdminService::new(state()).create(&session());
        let mut session = session();
        admin.on_idle(&mut session);
        assert_eq!(&session.take_output()[..], b"ERR idle timeout, closing\r\n");
    }
}
