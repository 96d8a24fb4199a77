//! Per-connection pipeline: read, decode, dispatch, write.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::session::{Session, SessionInfo};
use crate::tls::TlsContext;
use crate::{Error, Result};

/// Read chunk reserved before each socket read.
const READ_CHUNK: usize = 8192;

/// A stream the pipeline can read and write; plain TCP or TLS.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Eof,
    Idle,
    Handler,
    Shutdown,
}

/// Outcome of dispatching buffered input.
enum Dispatch {
    NeedMore,
    Continue,
    Close(CloseReason),
}

/// Resources shared by every connection of one listener.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) tls: Option<Arc<TlsContext>>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) undrained: Arc<AtomicUsize>,
}

pub(crate) struct Connection<H: Handler> {
    shared: Shared,
    handler: H,
    decoder: H::Decoder,
    session: Session,
    stream: Option<BoxIo>,
    buffer: BytesMut,
}

impl<H: Handler> Connection<H> {
    pub(crate) fn new(shared: Shared, handler: H, session: Session, stream: BoxIo) -> Self {
        let decoder = handler.decoder(&shared.config);
        Self {
            shared,
            handler,
            decoder,
            session,
            stream: Some(stream),
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Runs the connection to completion.
    pub(crate) async fn run(mut self) {
        let id = self.session.id();
        let peer = self.session.peer();
        debug!(session = %id, peer = %peer, "Session opened");

        match self.serve().await {
            Ok(reason) => debug!(session = %id, reason = ?reason, "Session ending"),
            Err(e) if e.is_disconnect() => debug!(session = %id, "Peer disconnected"),
            Err(e) => warn!(session = %id, peer = %peer, error = %e, "Session failed"),
        }

        self.finish().await;
        self.handler.on_close(self.session.info());
        debug!(
            session = %id,
            frames = self.session.info().frames(),
            "Session closed"
        );
    }

    async fn serve(&mut self) -> Result<CloseReason> {
        self.handler.on_open(&mut self.session)?;
        if let Some(reason) = self.after_callback().await? {
            return Ok(reason);
        }

        loop {
            loop {
                match self.dispatch_buffered().await? {
                    Dispatch::NeedMore => break,
                    Dispatch::Continue => {}
                    Dispatch::Close(reason) => return Ok(reason),
                }
            }

            let stream = self.stream.as_mut().ok_or_else(closed)?;
            self.buffer.reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                () = self.shared.shutdown.cancelled() => return Ok(CloseReason::Shutdown),
                read = timeout(self.shared.config.idle_timeout, stream.read_buf(&mut self.buffer)) => read,
            };

            match read {
                Err(_) => {
                    debug!(session = %self.session.id(), "Idle timeout");
                    self.handler.on_idle(&mut self.session);
                    return Ok(CloseReason::Idle);
                }
                Ok(Ok(0)) => return Ok(CloseReason::Eof),
                Ok(Ok(n)) => self.session.info().record_read(n),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Decodes and dispatches one buffered frame.
    async fn dispatch_buffered(&mut self) -> Result<Dispatch> {
        let frame = match self.decoder.decode(&mut self.buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Dispatch::NeedMore),
            Err(e) if e.is_recoverable() => {
                self.handler.on_decode_error(&e, &mut self.session);
                return self.after_dispatch().await;
            }
            Err(e) => return Err(e.into()),
        };

        self.session.info().record_frame();
        {
            let _permit = self
                .shared
                .workers
                .acquire()
                .await
                .map_err(|_| Error::Protocol("worker pool closed".into()))?;
            self.handler.on_frame(frame, &mut self.session)?;
        }
        self.after_dispatch().await
    }

    async fn after_dispatch(&mut self) -> Result<Dispatch> {
        Ok(match self.after_callback().await? {
            Some(reason) => Dispatch::Close(reason),
            None => Dispatch::Continue,
        })
    }

    /// Flushes queued writes and applies what the handler asked for.
    async fn after_callback(&mut self) -> Result<Option<CloseReason>> {
        if self.session.is_closing() {
            return Ok(Some(CloseReason::Handler));
        }
        if !self.flush().await? {
            return Ok(Some(CloseReason::Shutdown));
        }
        if self.session.take_start_tls() && !self.upgrade().await? {
            return Ok(Some(CloseReason::Shutdown));
        }
        if self.shared.shutdown.is_cancelled() {
            return Ok(Some(CloseReason::Shutdown));
        }
        Ok(None)
    }

    /// Writes the queue. Returns false if shutdown interrupted the write.
    async fn flush(&mut self) -> Result<bool> {
        if self.session.pending() == 0 {
            return Ok(true);
        }
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        let (outbound, info) = self.session.outbound_parts();
        let stall = self.shared.config.idle_timeout;
        tokio::select! {
            biased;
            () = self.shared.shutdown.cancelled() => Ok(false),
            written = timeout(stall, write_pending(stream, outbound, info)) => {
                written.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write stalled"))??;
                Ok(true)
            }
        }
    }

    /// Runs the TLS handshake. Returns false if shutdown interrupted it.
    async fn upgrade(&mut self) -> Result<bool> {
        let tls = self.shared.tls.clone().ok_or(Error::TlsUnavailable)?;
        if !self.buffer.is_empty() {
            return Err(Error::PlaintextBeforeTls);
        }
        let stream = self.stream.take().ok_or_else(closed)?;
        let handshake = tokio::select! {
            biased;
            () = self.shared.shutdown.cancelled() => {
                debug!(session = %self.session.id(), "Shutdown during TLS handshake");
                return Ok(false);
            }
            handshake = timeout(self.shared.config.idle_timeout, tls.acceptor().accept(stream)) => handshake,
        };
        let tls_stream = handshake
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
        self.stream = Some(Box::new(tls_stream));
        self.session.info().set_tls();
        info!(session = %self.session.id(), "TLS established");
        Ok(true)
    }

    /// Drains the write queue within the drain timeout, then shuts down.
    async fn finish(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        let id = self.session.id();
        let drain_timeout = self.shared.config.drain_timeout;

        if self.session.pending() > 0 {
            let (outbound, info) = self.session.outbound_parts();
            match timeout(drain_timeout, write_pending(&mut stream, outbound, info)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session = %id, error = %e, "Write queue not drained"),
                Err(_) => {
                    self.shared.undrained.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = %id,
                        pending = info.pending(),
                        timeout = ?drain_timeout,
                        "Forcing close with undrained write queue"
                    );
                }
            }
        }

        match timeout(drain_timeout, stream.shutdown()).await {
            Ok(Err(e)) => debug!(session = %id, error = %e, "Error closing connection"),
            Err(_) => debug!(session = %id, "Timed out closing connection"),
            Ok(Ok(())) => {}
        }
    }
}

/// Writes queued bytes until the queue is empty, then flushes.
///
/// Cancel-safe: bytes leave the queue only once written.
async fn write_pending(
    stream: &mut BoxIo,
    outbound: &mut BytesMut,
    info: &SessionInfo,
) -> io::Result<()> {
    while !outbound.is_empty() {
        let n = stream.write_buf(outbound).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        info.record_written(n);
    }
    stream.flush().await
}

fn closed() -> Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed").into()
}
