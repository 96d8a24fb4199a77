//! Session handles and per-session statistics.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared view of a live session, as listed by the registry.
#[derive(Debug)]
pub struct SessionInfo {
    id: SessionId,
    protocol: String,
    peer: SocketAddr,
    local: SocketAddr,
    started: DateTime<Utc>,
    frames: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    pending: AtomicUsize,
    tls: AtomicBool,
}

impl SessionInfo {
    /// Creates session info stamped with the current time.
    #[must_use]
    pub fn new(id: SessionId, protocol: impl Into<String>, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id,
            protocol: protocol.into(),
            peer,
            local,
            started: Utc::now(),
            frames: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            tls: AtomicBool::new(false),
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Listener protocol name.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Remote address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Local address.
    #[must_use]
    pub const fn local(&self) -> SocketAddr {
        self.local
    }

    /// When the session was accepted.
    #[must_use]
    pub const fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Frames decoded so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Bytes scheduled for writing but not yet written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Returns true once TLS is active.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    pub(crate) fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_scheduled(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.pending.fetch_sub(n, Ordering::Relaxed);
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_tls(&self) {
        self.tls.store(true, Ordering::Relaxed);
    }

    /// Returns the session as `key=value` pairs.
    #[must_use]
    pub fn to_record(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.to_string()),
            ("protocol", self.protocol.clone()),
            ("peer", self.peer.to_string()),
            ("local", self.local.to_string()),
            (
                "started",
                self.started.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("frames", self.frames().to_string()),
            ("bytes_in", self.bytes_in.load(Ordering::Relaxed).to_string()),
            ("bytes_out", self.bytes_out.load(Ordering::Relaxed).to_string()),
            ("pending", self.pending().to_string()),
            ("tls", self.is_tls().to_string()),
        ]
    }
}

/// The handler's handle on its connection.
///
/// Writes are queued and flushed by the connection task after each callback
/// returns, so handlers never block on the network.
#[derive(Debug)]
pub struct Session {
    info: Arc<SessionInfo>,
    outbound: BytesMut,
    close: bool,
    start_tls: bool,
    tls_available: bool,
}

impl Session {
    /// Creates a handle for a session. The server does this for every
    /// accepted connection.
    #[must_use]
    pub fn new(info: Arc<SessionInfo>, tls_available: bool) -> Self {
        Self {
            info,
            outbound: BytesMut::new(),
            close: false,
            start_tls: false,
            tls_available,
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.info.id
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.info.peer
    }

    /// Shared session info.
    #[must_use]
    pub const fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    /// Queues bytes for the peer.
    pub fn write(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
        self.info.record_scheduled(data.len());
    }

    /// Queues a line followed by CRLF.
    pub fn write_line(&mut self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write(&data);
    }

    /// Number of queued bytes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Removes the queued bytes without sending them.
    pub fn take_output(&mut self) -> BytesMut {
        let out = self.outbound.split();
        self.info.pending.fetch_sub(out.len(), Ordering::Relaxed);
        out
    }

    /// Asks the connection to close once queued bytes are written.
    pub fn close(&mut self) {
        self.close = true;
    }

    /// Returns true if the handler asked to close.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.close
    }

    /// Returns true if STARTTLS can be offered.
    #[must_use]
    pub fn tls_available(&self) -> bool {
        self.tls_available && !self.info.is_tls()
    }

    /// Returns true once TLS is active.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.info.is_tls()
    }

    /// Starts TLS after the queued bytes are written in plaintext.
    pub fn start_tls(&mut self) {
        self.start_tls = true;
    }

    pub(crate) fn outbound_parts(&mut self) -> (&mut BytesMut, &SessionInfo) {
        (&mut self.outbound, &self.info)
    }

    pub(crate) fn take_start_tls(&mut self) -> bool {
        std::mem::take(&mut self.start_tls)
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

    fn info() -> Arc<SessionInfo> {
        Arc::new(SessionInfo::new(
            SessionId(7),
            "admin",
            "192.0.2.1:4000".parse().unwrap(),
            "127.0.0.1:7026".parse().unwrap(),
        ))
    }

    #[test]
    fn test_writes_are_tracked_as_pending() {
        let info = info();
        let mut session = Session::new(info.clone(), false);
        session.write_line("OK");
        session.write(b"abc");
        assert_eq!(session.pending(), 7);
        assert_eq!(info.pending(), 7);

        info.record_written(4);
        assert_eq!(info.pending(), 3);
    }

    #[test]
    fn test_take_output_clears_queue() {
        let info = info();
        let mut session = Session::new(info.clone(), false);
        session.write_line("+OK");
        assert_eq!(&session.take_output()[..], b"+OK\r\n");
        assert_eq!(session.pending(), 0);
        assert_eq!(info.pending(), 0);
    }

    #[test]
    fn test_start_tls_flag_is_taken_once() {
        let mut session = Session::new(info(), true);
        assert!(session.tls_available());
        session.start_tls();
        assert!(session.take_start_tls());
        assert!(!session.take_start_tls());
    }

    #[test]
    fn test_record_fields() {
        let info = info();
        info.record_frame();
        info.record_read(10);
        let record = info.to_record();
        let get = |k: &str| record.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());
        assert_eq!(get("id").as_deref(), Some("7"));
        assert_eq!(get("protocol").as_deref(), Some("admin"));
        assert_eq!(get("peer").as_deref(), Some("192.0.2.1:4000"));
        assert_eq!(get("frames").as_deref(), Some("1"));
        assert_eq!(get("bytes_in").as_deref(), Some("10"));
        assert_eq!(get("tls").as_deref(), Some("false"));
        assert!(get("started").unwrap().ends_with('Z'));
    }
}
