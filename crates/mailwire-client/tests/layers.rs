//! Stream upgrades over an in-memory pipe: STARTTLS against a rustls
//! acceptor and an installed SASL security layer.

#![allow(clippy::unwrap_used)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailwire_client::{
    BoxFuture, BoxStream, Imap, MailConfig, MailConnection, Security, SocketFactory, State,
};
use mailwire_sasl::{AuthParams, AuthenticatorFactory, Qop, SaslAuthenticator, SecurityLayer};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    DuplexStream,
};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const WAIT: Duration = Duration::from_secs(5);

/// Hands out the client end of one pipe.
struct PipeFactory(Mutex<Option<DuplexStream>>);

impl SocketFactory for PipeFactory {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, io::Result<BoxStream>> {
        let stream = self.0.lock().unwrap().take();
        Box::pin(async move {
            stream
                .map(|s| Box::new(s) as BoxStream)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "pipe used"))
        })
    }
}

fn pipe() -> (Arc<PipeFactory>, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (Arc::new(PipeFactory(Mutex::new(Some(client)))), server)
}

fn tls_pair() -> (TlsAcceptor, Arc<rustls::ClientConfig>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key.into())
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (TlsAcceptor::from(Arc::new(server)), Arc::new(client))
}

async fn read_line<S: AsyncBufRead + Unpin>(stream: &mut S) -> String {
    let mut line = String::new();
    timeout(WAIT, stream.read_line(&mut line)).await.unwrap().unwrap();
    line
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) {
    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn imap_starttls_swaps_in_tls_stream() {
    let (acceptor, tls_config) = tls_pair();
    let (factory, server) = pipe();

    let server = tokio::spawn(async move {
        let mut plain = BufReader::new(server);
        send(&mut plain, b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n").await;
        assert_eq!(read_line(&mut plain).await, "A0001 STARTTLS\r\n");
        send(&mut plain, b"A0001 OK begin TLS\r\n").await;

        let tls = acceptor.accept(plain.into_inner()).await.unwrap();
        let mut tls = BufReader::new(tls);
        assert_eq!(read_line(&mut tls).await, "A0002 CAPABILITY\r\n");
        send(&mut tls, b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nA0002 OK done\r\n").await;
        assert_eq!(read_line(&mut tls).await, "A0003 LOGIN user secret\r\n");
        send(&mut tls, b"A0003 OK logged in\r\n").await;
        assert_eq!(read_line(&mut tls).await, "A0004 LOGOUT\r\n");
        send(&mut tls, b"* BYE\r\nA0004 OK done\r\n").await;
    });

    let config = MailConfig::builder("localhost")
        .security(Security::Tls)
        .authentication_id("user")
        .tls_config(tls_config)
        .socket_factory(factory)
        .build()
        .unwrap();
    let mut conn = MailConnection::<Imap>::new(config);

    conn.connect().await.unwrap();
    assert!(conn.is_tls());
    assert_eq!(conn.state(), State::NotAuthenticated);
    // Capabilities are re-read over TLS; the plaintext list is gone.
    assert!(conn.dialect().has_capability("AUTH=PLAIN"));
    assert!(!conn.dialect().has_capability("STARTTLS"));

    conn.login("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    conn.logout().await.unwrap();
    assert!(!conn.is_tls());

    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn imap_starttls_with_untrusted_certificate_closes() {
    let (acceptor, _) = tls_pair();
    let (factory, server) = pipe();

    let server = tokio::spawn(async move {
        let mut plain = BufReader::new(server);
        send(&mut plain, b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n").await;
        assert_eq!(read_line(&mut plain).await, "A0001 STARTTLS\r\n");
        send(&mut plain, b"A0001 OK begin TLS\r\n").await;
        assert!(acceptor.accept(plain.into_inner()).await.is_err());
    });

    // Default webpki roots do not trust the self-signed certificate.
    let config = MailConfig::builder("localhost")
        .security(Security::Tls)
        .socket_factory(factory)
        .build()
        .unwrap();
    let mut conn = MailConnection::<Imap>::new(config);

    assert!(conn.connect().await.is_err());
    assert_eq!(conn.state(), State::Closed);
    assert!(!conn.is_tls());

    timeout(WAIT, server).await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// SASL security layer
// ---------------------------------------------------------------------------

const XOR_KEY: u8 = 0x5a;

/// Toy confidentiality layer: every byte XORed with a fixed key.
struct XorLayer;

impl SecurityLayer for XorLayer {
    fn wrap(&mut self, plaintext: &[u8]) -> mailwire_sasl::Result<Vec<u8>> {
        Ok(xor(plaintext))
    }

    fn unwrap(&mut self, wrapped: &[u8]) -> mailwire_sasl::Result<Vec<u8>> {
        Ok(xor(wrapped))
    }

    fn max_buffer_size(&self) -> usize {
        65536
    }
}

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ XOR_KEY).collect()
}

fn frame(plaintext: &[u8]) -> Vec<u8> {
    let body = xor(plaintext);
    let mut out = u32::try_from(body.len()).unwrap().to_be_bytes().to_vec();
    out.extend_from_slice(&body);
    out
}

/// One-step mechanism that negotiates confidentiality.
struct LayeredAuthenticator {
    complete: bool,
    layer: Option<Box<dyn SecurityLayer>>,
}

impl SaslAuthenticator for LayeredAuthenticator {
    fn mechanism(&self) -> &str {
        "X-XOR"
    }

    fn has_initial_response(&self) -> bool {
        false
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> mailwire_sasl::Result<Vec<u8>> {
        if self.complete {
            return Err(mailwire_sasl::Error::AlreadyComplete);
        }
        self.complete = true;
        Ok(b"ok".to_vec())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn negotiated_qop(&self) -> Option<Qop> {
        Some(Qop::AuthConf)
    }

    fn take_security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        self.layer.take()
    }
}

struct LayeredFactory;

impl AuthenticatorFactory for LayeredFactory {
    fn create(&self, _params: &AuthParams) -> mailwire_sasl::Result<Box<dyn SaslAuthenticator>> {
        Ok(Box::new(LayeredAuthenticator {
            complete: false,
            layer: Some(Box::new(XorLayer)),
        }))
    }

    fn supports(&self, mechanism: &str) -> bool {
        mechanism.eq_ignore_ascii_case("X-XOR")
    }
}

#[tokio::test]
async fn imap_authenticate_installs_security_layer() {
    let (factory, server) = pipe();

    let server = tokio::spawn(async move {
        let mut plain = BufReader::new(server);
        send(&mut plain, b"* OK [CAPABILITY IMAP4rev1 AUTH=X-XOR] ready\r\n").await;
        assert_eq!(read_line(&mut plain).await, "A0001 AUTHENTICATE X-XOR\r\n");
        send(&mut plain, b"+ \r\n").await;
        assert_eq!(read_line(&mut plain).await, "b2s=\r\n");
        send(&mut plain, b"A0001 OK authenticated\r\n").await;

        // From here on every buffer is length-prefixed and XORed.
        let expected = b"A0002 NOOP\r\n";
        let mut wire = vec![0u8; 4 + expected.len()];
        timeout(WAIT, plain.read_exact(&mut wire)).await.unwrap().unwrap();
        assert_eq!(wire[..4], [0, 0, 0, 12]);
        assert_ne!(&wire[4..], expected);
        assert_eq!(xor(&wire[4..]), expected);

        send(&mut plain, &frame(b"A0002 OK NOOP completed\r\n")).await;
    });

    let config = MailConfig::builder("imap.example.com")
        .security(Security::None)
        .authentication_id("user")
        .mechanism("X-XOR")
        .authenticator_factory(Arc::new(LayeredFactory))
        .socket_factory(factory)
        .build()
        .unwrap();
    let mut conn = MailConnection::<Imap>::new(config);

    conn.connect().await.unwrap();
    conn.authenticate("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    assert_eq!(conn.qop(), Some(Qop::AuthConf));

    conn.noop().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap();
    conn.close().await;
    assert_eq!(conn.qop(), None);
}
