//! Listener accept loop and shutdown sequencing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, Shared};
use crate::handler::HandlerFactory;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionInfo};
use crate::tls::TlsContext;
use crate::Result;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What happened during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions still running when the grace period ran out.
    pub forced: usize,
    /// Sessions closed before their write queue was drained.
    pub undrained: usize,
}

/// Remote control for a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    registry: SessionRegistry,
}

impl ServerHandle {
    /// Starts graceful shutdown. Calling it more than once has no effect.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns true once shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Live sessions ordered by id.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SessionInfo>> {
        self.registry.snapshot()
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

/// A bound listener serving one protocol.
pub struct Server<F: HandlerFactory> {
    listener: TcpListener,
    factory: Arc<F>,
    registry: SessionRegistry,
    tracker: TaskTracker,
    shared: Shared,
}

impl<F: HandlerFactory> Server<F> {
    /// Validates the configuration and binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the bind fails.
    pub async fn bind(config: ServerConfig, factory: F, tls: Option<Arc<TlsContext>>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind).await?;
        info!(
            listener = %config.name,
            addr = %listener.local_addr()?,
            tls = tls.is_some(),
            "Listening"
        );

        let registry = SessionRegistry::new(config.max_sessions);
        let shared = Shared {
            workers: Arc::new(Semaphore::new(config.workers)),
            config: Arc::new(config),
            tls,
            shutdown: CancellationToken::new(),
            undrained: Arc::new(AtomicUsize::new(0)),
        };
        Ok(Self {
            listener,
            factory: Arc::new(factory),
            registry,
            tracker: TaskTracker::new(),
            shared,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns a handle for shutdown and session listing.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shared.shutdown.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Accepts connections until shutdown, then winds the sessions down.
    ///
    /// Shutdown stops the accept loop and refuses new sessions, interrupts
    /// idle sessions at once and lets busy ones finish their current frame.
    /// Sessions still running after the grace period are aborted.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and retried.
    pub async fn run(self) -> Result<ShutdownReport> {
        let Self {
            listener,
            factory,
            registry,
            tracker,
            shared,
        } = self;
        let name = shared.config.name.clone();

        loop {
            let accepted = tokio::select! {
                biased;
                () = shared.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    spawn_session(&shared, &factory, &registry, &tracker, socket, peer);
                }
                Err(e) => {
                    warn!(listener = %name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        registry.close();
        info!(listener = %name, active = registry.len(), "Shutting down");

        tracker.close();
        let grace = shared.config.shutdown_grace;
        let forced = if tokio::time::timeout(grace, tracker.wait()).await.is_ok() {
            0
        } else {
            let forced = registry.abort_all();
            warn!(
                listener = %name,
                sessions = forced,
                grace = ?grace,
                "Grace period elapsed, terminating sessions"
            );
            tracker.wait().await;
            forced
        };

        let report = ShutdownReport {
            forced,
            undrained: shared.undrained.load(Ordering::Relaxed),
        };
        info!(listener = %name, forced = report.forced, undrained = report.undrained, "Stopped");
        Ok(report)
    }
}

fn spawn_session<F: HandlerFactory>(
    shared: &Shared,
    factory: &Arc<F>,
    registry: &SessionRegistry,
    tracker: &TaskTracker,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let local = socket.local_addr().unwrap_or(shared.config.bind);
    let Some(guard) = registry.try_register(factory.name(), peer, local) else {
        warn!(
            listener = %shared.config.name,
            peer = %peer,
            max_sessions = shared.config.max_sessions,
            "Refusing connection, session limit reached"
        );
        return;
    };

    let id = guard.info().id();
    let session = Session::new(Arc::clone(guard.info()), shared.tls.is_some());
    let handler = factory.create(&session);
    let connection = Connection::new(shared.clone(), handler, session, Box::new(socket));
    debug!(session = %id, peer = %peer, "Accepted");

    let task = tracker.spawn(async move {
        let _guard = guard;
        connection.run().await;
    });
    registry.set_abort(id, task.abort_handle());
}
