//! Server lifecycle tests over loopback TCP.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mailwire_codec::{DecodeError, Frame, LineDecoder};
use mailwire_server::{
    Handler, HandlerFactory, Server, ServerConfig, ServerConfigBuilder, ServerHandle,
    ShutdownReport, Session, SessionInfo, TlsContext,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Line handler used by every test.
struct TestHandler {
    closed: Arc<AtomicUsize>,
}

impl Handler for TestHandler {
    type Decoder = LineDecoder;

    fn decoder(&self, config: &ServerConfig) -> LineDecoder {
        LineDecoder::new(config.max_line_length, config.max_literal_size)
    }

    fn on_open(&mut self, session: &mut Session) -> mailwire_server::Result<()> {
        session.write_line("* OK ready");
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, session: &mut Session) -> mailwire_server::Result<()> {
        let line = match frame {
            Frame::Literal(bytes) => {
                session.write_line(&format!("LITERAL {}", bytes.len()));
                return Ok(());
            }
            Frame::Line(line) => line,
        };
        match line.as_str() {
            "QUIT" => {
                session.write_line("BYE");
                session.close();
            }
            "STARTTLS" if session.tls_available() => {
                session.write_line("OK begin TLS");
                session.start_tls();
            }
            "STARTTLS" => session.write_line("NO TLS unavailable"),
            "BIG" => session.write(&vec![b'x'; 32 * 1024 * 1024]),
            _ if session.is_tls() => session.write_line(&format!("ECHO tls {line}")),
            _ => session.write_line(&format!("ECHO {line}")),
        }
        Ok(())
    }

    fn on_decode_error(&mut self, error: &DecodeError, session: &mut Session) {
        session.write_line(&format!("BAD {error}"));
    }

    fn on_idle(&mut self, session: &mut Session) {
        session.write_line("* BYE idle timeout");
    }

    fn on_close(&mut self, _info: &SessionInfo) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestFactory {
    closed: Arc<AtomicUsize>,
}

impl HandlerFactory for TestFactory {
    type Handler = TestHandler;

    fn name(&self) -> &str {
        "test"
    }

    fn create(&self, _session: &Session) -> TestHandler {
        TestHandler {
            closed: Arc::clone(&self.closed),
        }
    }
}

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<mailwire_server::Result<ShutdownReport>>,
    closed: Arc<AtomicUsize>,
}

impl Running {
    async fn stop(self) -> ShutdownReport {
        self.handle.shutdown();
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap()
    }
}

fn config() -> ServerConfigBuilder {
    ServerConfig::builder("test", "127.0.0.1:0".parse().unwrap())
}

async fn start(builder: ServerConfigBuilder, tls: Option<Arc<TlsContext>>) -> Running {
    let closed = Arc::new(AtomicUsize::new(0));
    let factory = TestFactory {
        closed: Arc::clone(&closed),
    };
    let server = Server::bind(builder.build().unwrap(), factory, tls)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(server.run());
    Running {
        addr,
        handle,
        task,
        closed,
    }
}

struct Client<S> {
    reader: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    async fn send(&mut self, data: &str) {
        self.reader.get_mut().write_all(data.as_bytes()).await.unwrap();
    }

    /// Reads one line; `None` on EOF or reset.
    async fn line(&mut self) -> Option<String> {
        let mut line = String::new();
        match timeout(WAIT, self.reader.read_line(&mut line)).await.unwrap() {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end().to_string()),
        }
    }

    fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

async fn connect(addr: SocketAddr) -> Client<TcpStream> {
    Client::new(TcpStream::connect(addr).await.unwrap())
}

async fn wait_for_sessions(handle: &ServerHandle, count: usize) {
    timeout(WAIT, async {
        while handle.sessions().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn tls_pair() -> (Arc<TlsContext>, Arc<rustls::ClientConfig>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    let context = TlsContext::new(vec![cert.clone()], key.into(), &[]).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (Arc::new(context), Arc::new(client))
}

#[tokio::test]
async fn test_echo_and_quit() {
    let server = start(config(), None).await;
    let mut client = connect(server.addr).await;

    assert_eq!(client.line().await.as_deref(), Some("* OK ready"));
    client.send("hello\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("ECHO hello"));
    client.send("QUIT\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("BYE"));
    assert_eq!(client.line().await, None);

    wait_for_sessions(&server.handle, 0).await;
    let closed = Arc::clone(&server.closed);
    let report = server.stop().await;
    assert_eq!(report, ShutdownReport::default());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_frames_split_across_writes_and_literals() {
    let server = start(config(), None).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    client.send("par").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send("tial\r\nA1 APPEND INBOX {5+}\r\nhel").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send("lo\r\n").await;

    assert_eq!(client.line().await.as_deref(), Some("ECHO partial"));
    assert_eq!(
        client.line().await.as_deref(),
        Some("ECHO A1 APPEND INBOX {5+}")
    );
    assert_eq!(client.line().await.as_deref(), Some("LITERAL 5"));
    assert_eq!(client.line().await.as_deref(), Some("ECHO"));

    let sessions = server.handle.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].frames(), 4);
    server.stop().await;
}

#[tokio::test]
async fn test_recoverable_decode_error_keeps_connection() {
    let server = start(config().max_line_length(16), None).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    client.send(&format!("{}\r\nping\r\n", "x".repeat(40))).await;
    let bad = client.line().await.unwrap();
    assert!(bad.starts_with("BAD line too long"), "{bad}");
    assert_eq!(client.line().await.as_deref(), Some("ECHO ping"));
    server.stop().await;
}

#[tokio::test]
async fn test_session_limit_refuses_before_greeting() {
    let server = start(config().max_sessions(1), None).await;
    let mut first = connect(server.addr).await;
    assert_eq!(first.line().await.as_deref(), Some("* OK ready"));

    let mut refused = connect(server.addr).await;
    assert_eq!(refused.line().await, None);

    first.send("QUIT\r\n").await;
    assert_eq!(first.line().await.as_deref(), Some("BYE"));
    wait_for_sessions(&server.handle, 0).await;

    let mut third = connect(server.addr).await;
    assert_eq!(third.line().await.as_deref(), Some("* OK ready"));
    server.stop().await;
}

#[tokio::test]
async fn test_idle_timeout_sends_banner() {
    let server = start(config().idle_timeout(Duration::from_millis(200)), None).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    assert_eq!(client.line().await.as_deref(), Some("* BYE idle timeout"));
    assert_eq!(client.line().await, None);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_sessions() {
    let server = start(config(), None).await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;
    a.line().await;
    b.line().await;
    wait_for_sessions(&server.handle, 2).await;

    let closed = Arc::clone(&server.closed);
    let report = server.stop().await;
    assert_eq!(report.forced, 0);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    assert_eq!(a.line().await, None);
    assert_eq!(b.line().await, None);
}

#[tokio::test]
async fn test_shutdown_forces_undrained_writes_closed() {
    let server = start(config().drain_timeout(Duration::from_millis(200)), None).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    // The reply is far larger than the socket buffers and is never read.
    client.send("BIG\r\n").await;
    timeout(WAIT, async {
        while server.handle.sessions()[0].pending() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = server.stop().await;
    assert_eq!(report.undrained, 1);
    assert_eq!(report.forced, 0);
    drop(client);
}

#[tokio::test]
async fn test_grace_period_aborts_stuck_sessions() {
    let server = start(
        config()
            .shutdown_grace(Duration::from_millis(200))
            .drain_timeout(Duration::from_secs(30)),
        None,
    )
    .await;
    let mut client = connect(server.addr).await;
    client.line().await;

    // The reply is never read, so closing blocks in the drain past the grace period.
    client.send("BIG\r\n").await;
    timeout(WAIT, async {
        while server.handle.sessions()[0].pending() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let closed = Arc::clone(&server.closed);
    let report = server.stop().await;
    assert_eq!(report.forced, 1);
    assert_eq!(report.undrained, 0);
    assert_eq!(closed.load(Ordering::SeqCst), 0);
    drop(client);
}

#[tokio::test]
async fn test_shutdown_interrupts_pending_tls_handshake() {
    let (tls, _) = tls_pair();
    let server = start(config().shutdown_grace(Duration::from_secs(3)), Some(tls)).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    // Never start the handshake, so the session waits in the TLS accept.
    client.send("STARTTLS\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("OK begin TLS"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed = Arc::clone(&server.closed);
    let started = tokio::time::Instant::now();
    let report = server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.forced, 0);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(client.line().await, None);
}

#[tokio::test]
async fn test_starttls_upgrade() {
    let (tls, client_config) = tls_pair();
    let server = start(config(), Some(tls)).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    client.send("STARTTLS\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("OK begin TLS"));

    let connector = tokio_rustls::TlsConnector::from(client_config);
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), client.into_inner())
        .await
        .unwrap();
    let mut client = Client::new(stream);
    client.send("hello\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("ECHO tls hello"));

    assert!(server.handle.sessions()[0].is_tls());
    client.send("STARTTLS\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("NO TLS unavailable"));
    server.stop().await;
}

#[tokio::test]
async fn test_plaintext_after_starttls_closes() {
    let (tls, _) = tls_pair();
    let server = start(config(), Some(tls)).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    client.send("STARTTLS\r\nhello\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("OK begin TLS"));
    assert_eq!(client.line().await, None);
    server.stop().await;
}

#[tokio::test]
async fn test_starttls_without_context() {
    let server = start(config(), None).await;
    let mut client = connect(server.addr).await;
    client.line().await;

    client.send("STARTTLS\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("NO TLS unavailable"));
    client.send("NOOP\r\n").await;
    assert_eq!(client.line().await.as_deref(), Some("ECHO NOOP"));
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_config_fails_bind() {
    let closed = Arc::new(AtomicUsize::new(0));
    let config = ServerConfig {
        workers: 0,
        ..config().build().unwrap()
    };
    let err = Server::bind(config, TestFactory { closed }, None)
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("workers must be greater than zero"));
}
