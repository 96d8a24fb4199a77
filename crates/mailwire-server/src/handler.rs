//! Protocol handler traits.

use mailwire_codec::DecodeError;
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::config::ServerConfig;
use crate::session::{Session, SessionInfo};
use crate::Result;

/// Per-connection protocol logic.
///
/// Callbacks are synchronous. Anything they write through the [`Session`] is
/// queued and flushed by the connection task once the callback returns.
pub trait Handler: Send + 'static {
    /// Frame decoder for this protocol.
    type Decoder: Decoder<Item: Send, Error = DecodeError> + Send + 'static;

    /// Creates the decoder for a new connection.
    fn decoder(&self, config: &ServerConfig) -> Self::Decoder;

    /// Called once before the first read, typically to send a greeting.
    ///
    /// # Errors
    ///
    /// An error closes the connection.
    fn on_open(&mut self, session: &mut Session) -> Result<()> {
        let _ = session;
        Ok(())
    }

    /// Called for every decoded frame, in arrival order.
    ///
    /// # Errors
    ///
    /// An error closes the connection.
    fn on_frame(
        &mut self,
        frame: <Self::Decoder as Decoder>::Item,
        session: &mut Session,
    ) -> Result<()>;

    /// Called for a framing error that spoiled one unit only.
    fn on_decode_error(&mut self, error: &DecodeError, session: &mut Session) {
        warn!(session = %session.id(), error = %error, "Discarded malformed frame");
    }

    /// Called when the idle timer fires. The connection closes afterwards.
    fn on_idle(&mut self, session: &mut Session) {
        let _ = session;
    }

    /// Called once after the connection is closed.
    fn on_close(&mut self, info: &SessionInfo) {
        let _ = info;
    }
}

/// Creates a [`Handler`] per accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Handler type produced by this factory.
    type Handler: Handler;

    /// Protocol name used in logs and session listings.
    fn name(&self) -> &str;

    /// Creates the handler for a newly registered session.
    fn create(&self, session: &Session) -> Self::Handler;
}
