//! Registry of live sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;

use crate::session::{SessionId, SessionInfo};

#[derive(Debug)]
struct Entry {
    info: Arc<SessionInfo>,
    abort: Option<AbortHandle>,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<SessionId, Entry>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    max_sessions: usize,
    next_id: AtomicU64,
    state: Mutex<State>,
}

/// Shared map of live sessions.
///
/// Registration and shutdown take the same lock, so once [`close`](Self::close)
/// returns no new session can appear while the registry is being iterated.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Creates a registry that admits at most `max_sessions` sessions.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_sessions,
                next_id: AtomicU64::new(1),
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new session.
    ///
    /// Returns `None` when the registry is full or closed. The session is
    /// removed when the returned guard is dropped.
    #[must_use]
    pub fn try_register(
        &self,
        protocol: &str,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Option<SessionGuard> {
        let mut state = self.lock();
        if state.closed || state.sessions.len() >= self.inner.max_sessions {
            return None;
        }
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let info = Arc::new(SessionInfo::new(id, protocol, peer, local));
        state.sessions.insert(
            id,
            Entry {
                info: Arc::clone(&info),
                abort: None,
            },
        );
        drop(state);
        Some(SessionGuard {
            registry: self.clone(),
            info,
        })
    }

    /// Attaches the task abort handle used for forced termination.
    pub fn set_abort(&self, id: SessionId, abort: AbortHandle) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    /// Returns the live sessions ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<SessionInfo>> {
        let mut sessions: Vec<_> = self
            .lock()
            .sessions
            .values()
            .map(|e| Arc::clone(&e.info))
            .collect();
        sessions.sort_by_key(|info| info.id());
        sessions
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Returns true if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses all further registrations.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Returns true once the registry refuses registrations.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Aborts every live session task, returning how many were aborted.
    pub fn abort_all(&self) -> usize {
        let state = self.lock();
        let mut aborted = 0;
        for entry in state.sessions.values() {
            if let Some(abort) = &entry.abort {
                abort.abort();
                aborted += 1;
            }
        }
        aborted
    }

    fn remove(&self, id: SessionId) {
        self.lock().sessions.remove(&id);
    }
}

/// Keeps a session registered until dropped.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    info: Arc<SessionInfo>,
}

impl SessionGuard {
    /// The registered session.
    #[must_use]
    pub const fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.info.id());
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

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_ceiling_refuses_new_sessions() {
        let registry = SessionRegistry::new(2);
        let a = registry.try_register("admin", addr(1), addr(9)).unwrap();
        let _b = registry.try_register("admin", addr(2), addr(9)).unwrap();
        assert!(registry.try_register("admin", addr(3), addr(9)).is_none());

        drop(a);
        assert_eq!(registry.len(), 1);
        assert!(registry.try_register("admin", addr(3), addr(9)).is_some());
    }

    #[test]
    fn test_closed_registry_refuses() {
        let registry = SessionRegistry::new(8);
        let _live = registry.try_register("milter", addr(1), addr(9)).unwrap();
        registry.close();
        assert!(registry.is_closed());
        assert!(registry.try_register("milter", addr(2), addr(9)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_and_ids_are_unique() {
        let registry = SessionRegistry::new(8);
        let guards: Vec<_> = (0..3)
            .map(|p| registry.try_register("milter", addr(p), addr(9)).unwrap())
            .collect();
        let ids: Vec<_> = registry.snapshot().iter().map(|i| i.id()).collect();
        assert_eq!(ids, guards.iter().map(|g| g.info().id()).collect::<Vec<_>>());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_abort_all_stops_tasks() {
        let registry = SessionRegistry::new(8);
        let guard = registry.try_register("milter", addr(1), addr(9)).unwrap();
        let task = tokio::spawn(std::future::pending::<()>());
        registry.set_abort(guard.info().id(), task.abort_handle());

        assert_eq!(registry.abort_all(), 1);
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
