//! Mail connection state machine.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mailwire_codec::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_LITERAL_SIZE, LineDecoder};
use mailwire_sasl::{AuthParams, Qop, SaslAuthenticator, SaslStream};
use tracing::{debug, info, warn};

use crate::dialect::{Dialect, LoginStep, Request};
use crate::reply::{Reply, Status};
use crate::stream::{BoxStream, upgrade_to_tls};
use crate::transport::Transport;
use crate::{Error, MailConfig, Result, Security};

/// Connection state.
///
/// `Closed` leads to `NotAuthenticated` (or straight to `Authenticated` on a
/// pre-authenticated greeting), then `Authenticated` and `Selected`. `Logout`
/// is transitional before `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// No transport.
    #[default]
    Closed,
    /// Greeting received; waiting for credentials.
    NotAuthenticated,
    /// Logged in.
    Authenticated,
    /// A mailbox is selected.
    Selected,
    /// Logging out.
    Logout,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Selected => "SELECTED",
            Self::Logout => "LOGOUT",
        })
    }
}

/// A client connection to a mail server.
///
/// The connection owns its transport and runs one command at a time; every
/// operation completes its exchange before returning.
pub struct MailConnection<D: Dialect> {
    config: MailConfig,
    pub(crate) dialect: D,
    state: State,
    transport: Option<Transport>,
    greeting: Option<String>,
    tls: bool,
    qop: Option<Qop>,
    authenticator: Option<Box<dyn SaslAuthenticator>>,
}

impl<D: Dialect + fmt::Debug> fmt::Debug for MailConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConnection")
            .field("protocol", &D::NAME)
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("tls", &self.tls)
            .field("qop", &self.qop)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl<D: Dialect> MailConnection<D> {
    /// Creates a closed connection.
    #[must_use]
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            dialect: D::default(),
            state: State::Closed,
            transport: None,
            greeting: None,
            tls: false,
            qop: None,
            authenticator: None,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MailConfig {
        &self.config
    }

    /// Returns the protocol session details.
    #[must_use]
    pub const fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Returns the greeting text of the current session.
    #[must_use]
    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    /// Returns true if the transport is encrypted with TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    /// Returns the negotiated SASL quality of protection.
    #[must_use]
    pub const fn qop(&self) -> Option<Qop> {
        self.qop
    }

    /// Returns the port in use: the configured one or the protocol default.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config
            .port
            .unwrap_or_else(|| D::default_port(self.config.security))
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(protocol = D::NAME, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    /// Fails unless the connection is in one of `allowed`.
    pub(crate) fn check_state(&self, allowed: &[State]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::IllegalState {
            expected: allowed.first().copied().unwrap_or_default(),
            actual: self.state,
        })
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::Closed)
    }

    /// Opens the connection and reads the greeting.
    ///
    /// Does nothing unless the connection is closed. With [`Security::Tls`] a
    /// STARTTLS failure is fatal; with [`Security::TlsIfAvailable`] a refused
    /// STARTTLS is logged and the session continues in plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened, the greeting is a
    /// rejection, or a required TLS upgrade fails. The transport is closed
    /// before the error is returned.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != State::Closed {
            return Ok(());
        }
        if let Err(e) = self.open().await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        let host = self.config.host.clone();
        let port = self.port();
        let connect_timeout = self.config.connect_timeout;
        info!(protocol = D::NAME, %host, port, "connecting");

        let factory = self.config.socket_factory.clone();
        let tls_config = self.config.tls_config.clone();
        let implicit = self.config.security.is_implicit();
        let stream = tokio::time::timeout(connect_timeout, async {
            let stream = factory.connect(&host, port).await?;
            if implicit {
                upgrade_to_tls(stream, &host, tls_config).await
            } else {
                Ok(stream)
            }
        })
        .await
        .map_err(|_| Error::Timeout(connect_timeout))??;
        self.tls = implicit;

        let mut decoder = LineDecoder::new(DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_LITERAL_SIZE);
        if !D::supports_literals() {
            decoder = decoder.without_literals();
        }
        self.transport = Some(Transport::new(stream, decoder, self.config.read_timeout));

        let transport = self.transport.as_mut().ok_or(Error::Closed)?;
        let reply = transport.read_reply(&self.dialect, None).await?;
        let state = self.dialect.greeting(&reply)?;
        self.greeting = Some(reply.text);
        self.set_state(state);
        self.handshake().await?;

        match self.config.security {
            Security::Tls => self.start_tls().await?,
            Security::TlsIfAvailable => {
                if let Err(e) = self.start_tls().await {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    warn!(protocol = D::NAME, error = %e, "STARTTLS unavailable, continuing without TLS");
                }
            }
            Security::None | Security::Ssl => {}
        }
        Ok(())
    }

    /// Runs the protocol handshake, trying each alternative until one succeeds.
    async fn handshake(&mut self) -> Result<()> {
        let mut last = None;
        for command in self.dialect.handshake(&self.config) {
            let (request, reply) = self.exchange(&command).await?;
            if reply.is_ok() {
                self.dialect.record_handshake(&reply);
                return Ok(());
            }
            debug!(command = %request.name, reply = %reply.text, "handshake alternative refused");
            last = Some(Error::command(request.name, reply.text));
        }
        last.map_or(Ok(()), Err)
    }

    /// Upgrades the connection with STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] unless the connection is not yet
    /// authenticated, a command error if the server refuses, and a TLS error
    /// if the handshake fails. A failed handshake closes the connection.
    pub async fn start_tls(&mut self) -> Result<()> {
        self.check_state(&[State::NotAuthenticated])?;
        let command = self.dialect.starttls_command();
        self.execute_ok(command).await?;

        let stream = self.transport()?.take_stream()?;
        let host = self.config.host.clone();
        match upgrade_to_tls(stream, &host, self.config.tls_config.clone()).await {
            Ok(tls) => self.transport()?.put_stream(tls),
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        }
        self.tls = true;
        info!(protocol = D::NAME, %host, "TLS established");

        self.dialect.reset_after_tls();
        self.handshake().await
    }

    /// Logs in with the protocol's plaintext login command.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is wrong, no authentication id is
    /// configured, or the server rejects the credentials.
    pub async fn login(&mut self, password: &str) -> Result<()> {
        self.check_state(&[State::NotAuthenticated])?;
        let user = self
            .config
            .authentication_id
            .clone()
            .ok_or_else(|| Error::Config("authentication id is required".into()))?;

        let steps = self.dialect.login_steps(&user, password);
        let last = steps.len().saturating_sub(1);
        let mut tag = None;
        let mut name = String::from("LOGIN");
        for (i, step) in steps.into_iter().enumerate() {
            let line = match step {
                LoginStep::Command(command) => {
                    let request = self.dialect.request(&command);
                    tag = request.tag;
                    name = request.name;
                    request.line
                }
                LoginStep::Respond(response) => response,
            };
            let transport = self.transport.as_mut().ok_or(Error::Closed)?;
            transport.write_line(&line).await?;
            let reply = transport.read_reply(&self.dialect, tag.as_deref()).await?;
            match reply.status {
                Status::Ok if i == last => {
                    self.dialect.observe(&reply);
                }
                Status::Ok | Status::Continue if i < last => {}
                _ => return Err(Error::command(name, reply.text)),
            }
        }

        info!(protocol = D::NAME, %user, "logged in");
        self.set_state(State::Authenticated);
        Ok(())
    }

    /// Authenticates with SASL.
    ///
    /// Without a configured mechanism (and no protocol preference), or with
    /// `LOGIN`, this is [`login`](Self::login). If the mechanism negotiates a
    /// security layer the transport is wrapped before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is wrong, the mechanism is unsupported,
    /// or the server rejects the exchange.
    pub async fn authenticate(&mut self, password: &str) -> Result<()> {
        self.check_state(&[State::NotAuthenticated])?;
        let mechanism = self
            .config
            .mechanism
            .clone()
            .or_else(|| self.dialect.preferred_mechanism().map(str::to_string));
        let Some(mechanism) = mechanism else {
            return self.login(password).await;
        };
        if mechanism.eq_ignore_ascii_case(mailwire_sasl::LOGIN) {
            return self.login(password).await;
        }

        let user = self
            .config
            .authentication_id
            .clone()
            .ok_or_else(|| Error::Config("authentication id is required".into()))?;
        let params = AuthParams {
            mechanism,
            authentication_id: user.clone(),
            authorization_id: self.config.authorization_id.clone(),
            password: Some(password.to_string()),
            realm: self.config.realm.clone(),
            host: Some(self.config.host.clone()),
            service: Some(D::SERVICE.to_string()),
            properties: self.config.properties.clone(),
        };
        let mut auth = self.config.authenticator_factory.create(&params)?;

        let initial = if self.config.initial_response
            && auth.has_initial_response()
            && self.dialect.allows_initial_response()
        {
            Some(STANDARD.encode(auth.initial_response()?))
        } else {
            None
        };
        let command = self
            .dialect
            .authenticate_command(auth.mechanism(), initial.as_deref());
        let request = self.dialect.request(&command);
        let transport = self.transport.as_mut().ok_or(Error::Closed)?;
        transport.write_line(&request.line).await?;

        loop {
            let reply = transport
                .read_reply(&self.dialect, request.tag.as_deref())
                .await?;
            match reply.status {
                Status::Continue => {
                    let response = STANDARD
                        .decode(reply.text.trim())
                        .map_err(Error::from)
                        .and_then(|challenge| Ok(auth.evaluate_challenge(&challenge)?));
                    match response {
                        Ok(response) => transport.write_line(&STANDARD.encode(response)).await?,
                        Err(e) => {
                            // Cancel the exchange so the session stays usable.
                            transport.write_line("*").await?;
                            transport
                                .read_reply(&self.dialect, request.tag.as_deref())
                                .await?;
                            return Err(e);
                        }
                    }
                }
                Status::Ok => {
                    if !auth.is_complete() {
                        return Err(Error::Parse(format!(
                            "server reported success before the {} exchange completed",
                            auth.mechanism()
                        )));
                    }
                    self.dialect.observe(&reply);
                    break;
                }
                _ => return Err(Error::command(request.name, reply.text)),
            }
        }

        info!(protocol = D::NAME, %user, mechanism = auth.mechanism(), "authenticated");
        self.set_state(State::Authenticated);

        let qop = auth.negotiated_qop();
        if qop.is_some_and(Qop::has_security_layer) {
            if let Some(layer) = auth.take_security_layer() {
                let stream = self.transport()?.take_stream()?;
                let wrapped: BoxStream = Box::new(SaslStream::new(stream, layer));
                self.transport()?.put_stream(wrapped);
                debug!(protocol = D::NAME, ?qop, "SASL security layer installed");
            }
        }
        self.qop = qop;
        self.authenticator = Some(auth);
        Ok(())
    }

    /// Logs out and closes the connection.
    ///
    /// The connection is closed even if the logout command fails.
    ///
    /// # Errors
    ///
    /// Returns the logout command's failure.
    pub async fn logout(&mut self) -> Result<()> {
        if matches!(self.state, State::Closed | State::Logout) {
            return Ok(());
        }
        self.set_state(State::Logout);
        let command = self.dialect.logout_command();
        let result = self.execute_ok(command).await.map(|_| ());
        if let Err(e) = &result {
            debug!(protocol = D::NAME, error = %e, "logout failed, closing anyway");
        }
        self.close().await;
        result
    }

    /// Closes the connection. Safe to call more than once.
    ///
    /// Close-time I/O errors are logged, not returned. The shutdown of the
    /// transport is bounded by the read timeout.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let limit = self.config.read_timeout;
            match tokio::time::timeout(limit, transport.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(protocol = D::NAME, error = %e, "error closing connection"),
                Err(_) => debug!(protocol = D::NAME, timeout = ?limit, "timed out closing connection"),
            }
            info!(protocol = D::NAME, host = %self.config.host, "connection closed");
        }
        self.set_state(State::Closed);
        self.tls = false;
        self.qop = None;
        if let Some(mut auth) = self.authenticator.take() {
            auth.dispose();
        }
    }

    /// Sends a command and reads its reply, whatever the status.
    async fn exchange(&mut self, command: &str) -> Result<(Request, Reply)> {
        let request = self.dialect.request(command);
        let transport = self.transport.as_mut().ok_or(Error::Closed)?;
        debug!(protocol = D::NAME, command = %request.name, "C: command");
        transport.write_line(&request.line).await?;
        let reply = transport
            .read_reply(&self.dialect, request.tag.as_deref())
            .await?;
        if reply.is_ok() {
            self.dialect.observe(&reply);
        }
        Ok((request, reply))
    }

    /// Sends a command and returns its reply.
    pub(crate) async fn execute(&mut self, command: &str) -> Result<Reply> {
        self.exchange(command).await.map(|(_, reply)| reply)
    }

    /// Sends a command and fails unless the server reports success.
    pub(crate) async fn execute_ok(&mut self, command: &str) -> Result<Reply> {
        let (request, reply) = self.exchange(command).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(Error::command(request.name, reply.text))
        }
    }

    /// Writes raw bytes and reads the untagged reply that follows.
    pub(crate) async fn send_raw(&mut self, data: &[u8]) -> Result<Reply> {
        let transport = self.transport.as_mut().ok_or(Error::Closed)?;
        transport.write_raw(data).await?;
        transport.read_reply(&self.dialect, None).await
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
    use crate::Imap;

    fn closed() -> MailConnection<Imap> {
        MailConnection::new(MailConfig::builder("imap.example.com").build().unwrap())
    }

    #[test]
    fn test_new_connection_is_closed() {
        let conn = closed();
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.port(), 143);
        assert!(!conn.is_tls());
        assert!(conn.greeting().is_none());
    }

    #[test]
    fn test_check_state() {
        let mut conn = closed();
        conn.state = State::Authenticated;
        assert!(conn.check_state(&[State::Authenticated, State::Selected]).is_ok());
        let err = conn.check_state(&[State::NotAuthenticated]).unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalState {
                expected: State::NotAuthenticated,
                actual: State::Authenticated
            }
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut conn = closed();
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_login_requires_not_authenticated() {
        let mut conn = closed();
        let err = conn.login("secret").await.unwrap_err();
        assert!(matches!(err, Error::IllegalState { actual: State::Closed, .. }));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::NotAuthenticated.to_string(), "NOT_AUTHENTICATED");
        assert_eq!(State::default(), State::Closed);
    }
}
