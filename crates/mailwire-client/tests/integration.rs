//! Integration tests for the client state machine.
//!
//! Each test scripts a server with `tokio_test::io::Builder`; the mock checks
//! every byte the client writes and fails on anything unexpected.

#![allow(clippy::unwrap_used)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_test::io::{Builder, Mock};

use mailwire_client::{
    BoxFuture, BoxStream, Error, Imap, MailConfig, MailConfigBuilder, MailConnection, Pop3,
    Security, Smtp, SocketFactory, State,
};

/// Hands out one scripted stream.
struct MockFactory(Mutex<Option<Mock>>);

impl SocketFactory for MockFactory {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, io::Result<BoxStream>> {
        let mock = self.0.lock().unwrap().take();
        Box::pin(async move {
            mock.map(|m| Box::new(m) as BoxStream)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no script"))
        })
    }
}

fn config(host: &str, mock: Mock) -> MailConfigBuilder {
    MailConfig::builder(host)
        .security(Security::None)
        .authentication_id("user")
        .socket_factory(Arc::new(MockFactory(Mutex::new(Some(mock)))))
}

fn imap(builder: MailConfigBuilder) -> MailConnection<Imap> {
    MailConnection::new(builder.build().unwrap())
}

// ---------------------------------------------------------------------------
// IMAP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn imap_login_and_logout() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n")
        .write(b"A0001 LOGIN user secret\r\n")
        .read(b"A0001 OK LOGIN completed\r\n")
        .write(b"A0002 LOGOUT\r\n")
        .read(b"* BYE logging out\r\nA0002 OK done\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), State::NotAuthenticated);
    assert_eq!(conn.greeting(), Some("[CAPABILITY IMAP4rev1 AUTH=PLAIN] ready"));
    assert!(conn.dialect().has_capability("imap4rev1"));

    conn.login("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);

    conn.logout().await.unwrap();
    assert_eq!(conn.state(), State::Closed);
}

#[tokio::test]
async fn imap_operations_check_state_before_writing() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
        .write(b"A0001 LOGIN user secret\r\n")
        .read(b"A0001 OK done\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));
    conn.connect().await.unwrap();
    conn.login("secret").await.unwrap();

    let err = conn.login("secret").await.unwrap_err();
    assert!(matches!(
        err,
        Error::IllegalState {
            expected: State::NotAuthenticated,
            actual: State::Authenticated
        }
    ));
    assert!(err.is_recoverable());

    let err = conn.start_tls().await.unwrap_err();
    assert!(matches!(err, Error::IllegalState { .. }));
    assert_eq!(conn.state(), State::Authenticated);
    conn.close().await;
}

#[tokio::test]
async fn imap_preauth_greeting_and_select() {
    let mock = Builder::new()
        .read(b"* PREAUTH [CAPABILITY IMAP4rev1] welcome back\r\n")
        .write(b"A0001 SELECT INBOX\r\n")
        .read(b"* 3 EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 42] valid\r\n")
        .read(b"* FLAGS (\\Seen \\Deleted)\r\nA0001 OK [READ-WRITE] SELECT completed\r\n")
        .write(b"A0002 SELECT \"No Such\"\r\n")
        .read(b"A0002 NO mailbox does not exist\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);

    let mailbox = conn.select("INBOX").await.unwrap();
    assert_eq!(mailbox.exists, 3);
    assert_eq!(mailbox.uid_validity, Some(42));
    assert_eq!(mailbox.flags, vec!["\\Seen", "\\Deleted"]);
    assert!(!mailbox.read_only);
    assert_eq!(conn.state(), State::Selected);
    assert_eq!(conn.dialect().selected(), Some("INBOX"));

    let err = conn.select("No Such").await.unwrap_err();
    assert_eq!(err.to_string(), "SELECT failed: mailbox does not exist");
    assert_eq!(conn.state(), State::Authenticated);
    assert_eq!(conn.dialect().selected(), None);
    conn.close().await;
}

#[tokio::test]
async fn imap_bye_greeting_closes() {
    let mock = Builder::new().read(b"* BYE too many connections\r\n").build();
    let mut conn = imap(config("imap.example.com", mock));

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Greeting(ref text) if text == "too many connections"));
    assert_eq!(conn.state(), State::Closed);
}

#[tokio::test]
async fn imap_capability_handshake_after_bare_greeting() {
    let mock = Builder::new()
        .read(b"* OK ready\r\n")
        .write(b"A0001 CAPABILITY\r\n")
        .read(b"* CAPABILITY IMAP4rev1 SASL-IR AUTH=PLAIN\r\nA0001 OK done\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));

    conn.connect().await.unwrap();
    assert!(conn.dialect().has_capability("SASL-IR"));
    assert_eq!(conn.dialect().auth_mechanisms().collect::<Vec<_>>(), vec!["PLAIN"]);
    conn.close().await;
}

#[tokio::test]
async fn imap_authenticate_plain_with_initial_response() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1 SASL-IR AUTH=PLAIN] ready\r\n")
        .write(b"A0001 AUTHENTICATE PLAIN AHVzZXIAc2VjcmV0\r\n")
        .read(b"A0001 OK authenticated\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock).mechanism("PLAIN"));

    conn.connect().await.unwrap();
    conn.authenticate("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    assert_eq!(conn.qop(), None);
    conn.close().await;
}

#[tokio::test]
async fn imap_authenticate_plain_without_sasl_ir() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n")
        .write(b"A0001 AUTHENTICATE PLAIN\r\n")
        .read(b"+ \r\n")
        .write(b"AHVzZXIAc2VjcmV0\r\n")
        .read(b"A0001 OK authenticated\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock).mechanism("plain"));

    conn.connect().await.unwrap();
    conn.authenticate("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    conn.close().await;
}

#[tokio::test]
async fn imap_authenticate_cancels_on_bad_challenge() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
        .write(b"A0001 AUTHENTICATE PLAIN\r\n")
        .read(b"+ Zm9v\r\n")
        .write(b"*\r\n")
        .read(b"A0001 BAD authentication cancelled\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock).mechanism("PLAIN"));

    conn.connect().await.unwrap();
    let err = conn.authenticate("secret").await.unwrap_err();
    assert!(matches!(err, Error::Sasl(_)));
    assert_eq!(conn.state(), State::NotAuthenticated);
    conn.close().await;
}

#[tokio::test]
async fn imap_rejected_login_is_recoverable() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
        .write(b"A0001 LOGIN user wrong\r\n")
        .read(b"A0001 NO [AUTHENTICATIONFAILED] invalid credentials\r\n")
        .write(b"A0002 LOGIN user secret\r\n")
        .read(b"A0002 OK done\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));

    conn.connect().await.unwrap();
    let err = conn.login("wrong").await.unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(
        err.to_string(),
        "LOGIN failed: [AUTHENTICATIONFAILED] invalid credentials"
    );
    assert_eq!(conn.state(), State::NotAuthenticated);

    conn.login("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    conn.close().await;
}

#[tokio::test]
async fn imap_login_quotes_arguments() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
        .write(b"A0001 LOGIN user \"pa ss\\\"word\"\r\n")
        .read(b"A0001 OK done\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));

    conn.connect().await.unwrap();
    conn.login("pa ss\"word").await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn imap_login_sends_line_breaks_as_literal() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
        .write(b"A0001 LOGIN user {11}\r\n")
        .read(b"+ Ready for literal data\r\n")
        .write(b"line\r\nbreak\r\n")
        .read(b"A0001 OK done\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock));

    conn.connect().await.unwrap();
    conn.login("line\r\nbreak").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    conn.close().await;
}

#[tokio::test(start_paused = true)]
async fn imap_greeting_timeout() {
    let mock = Builder::new().wait(Duration::from_secs(600)).build();
    let mut conn = imap(config("imap.example.com", mock).read_timeout(Duration::from_secs(5)));

    let err = conn.connect().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(conn.state(), State::Closed);
}

#[tokio::test]
async fn imap_refused_starttls_continues_when_optional() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n")
        .write(b"A0001 STARTTLS\r\n")
        .read(b"A0001 NO TLS not available\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock).security(Security::TlsIfAvailable));

    conn.connect().await.unwrap();
    assert!(!conn.is_tls());
    assert_eq!(conn.state(), State::NotAuthenticated);
    conn.close().await;
}

#[tokio::test]
async fn imap_refused_starttls_fails_when_required() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n")
        .write(b"A0001 STARTTLS\r\n")
        .read(b"A0001 NO TLS not available\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock).security(Security::Tls));

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Command { ref command, .. } if command == "STARTTLS"));
    assert_eq!(conn.state(), State::Closed);
}

#[tokio::test]
async fn imap_plaintext_after_starttls_is_rejected() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n")
        .write(b"A0001 STARTTLS\r\n")
        .read(b"A0001 OK begin TLS\r\n* 1 EXISTS\r\n")
        .build();
    let mut conn = imap(config("imap.example.com", mock).security(Security::Tls));

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
    assert_eq!(conn.state(), State::Closed);
    assert!(!conn.is_tls());
}

#[tokio::test]
async fn imap_connection_refused() {
    let factory = Arc::new(MockFactory(Mutex::new(None)));
    let config = MailConfig::builder("imap.example.com")
        .security(Security::None)
        .socket_factory(factory)
        .build()
        .unwrap();
    let mut conn = MailConnection::<Imap>::new(config);

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::ConnectionRefused));
    assert_eq!(conn.state(), State::Closed);
}

/// Scripted stream whose shutdown never completes.
struct StuckShutdown(Mock);

impl AsyncRead for StuckShutdown {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for StuckShutdown {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

struct StuckFactory(Mutex<Option<StuckShutdown>>);

impl SocketFactory for StuckFactory {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, io::Result<BoxStream>> {
        let stream = self.0.lock().unwrap().take();
        Box::pin(async move {
            stream
                .map(|s| Box::new(s) as BoxStream)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no script"))
        })
    }
}

#[tokio::test(start_paused = true)]
async fn close_gives_up_on_stuck_shutdown() {
    let mock = Builder::new()
        .read(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
        .build();
    let config = MailConfig::builder("imap.example.com")
        .security(Security::None)
        .read_timeout(Duration::from_secs(5))
        .socket_factory(Arc::new(StuckFactory(Mutex::new(Some(StuckShutdown(mock))))))
        .build()
        .unwrap();
    let mut conn = MailConnection::<Imap>::new(config);
    conn.connect().await.unwrap();

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(60), conn.close())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(conn.state(), State::Closed);
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn smtp_auth_login_and_send() {
    let mock = Builder::new()
        .read(b"220-smtp.example.com ESMTP\r\n220 ready\r\n")
        .write(b"EHLO client.test\r\n")
        .read(b"250-smtp.example.com\r\n250-SIZE 1000\r\n250 AUTH PLAIN LOGIN\r\n")
        .write(b"AUTH LOGIN\r\n")
        .read(b"334 VXNlcm5hbWU6\r\n")
        .write(b"dXNlcg==\r\n")
        .read(b"334 UGFzc3dvcmQ6\r\n")
        .write(b"c2VjcmV0\r\n")
        .read(b"235 2.7.0 authenticated\r\n")
        .write(b"MAIL FROM:<a@example.com>\r\n")
        .read(b"250 ok\r\n")
        .write(b"RCPT TO:<b@example.org>\r\n")
        .read(b"250 ok\r\n")
        .write(b"RCPT TO:<c@example.org>\r\n")
        .read(b"550 5.1.1 no such user\r\n")
        .write(b"DATA\r\n")
        .read(b"354 go ahead\r\n")
        .write(b"Subject: t\r\n\r\n..dot\r\n.\r\n")
        .read(b"250 queued\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 bye\r\n")
        .build();
    let config = config("smtp.example.com", mock)
        .domain("client.test")
        .build()
        .unwrap();
    let mut conn = MailConnection::<Smtp>::new(config);

    conn.connect().await.unwrap();
    assert_eq!(conn.port(), 25);
    assert_eq!(conn.dialect().extension("SIZE"), Some("1000"));

    conn.authenticate("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);

    let report = conn
        .send_message(
            "a@example.com",
            &["b@example.org", "c@example.org"],
            b"Subject: t\n\n.dot\n",
        )
        .await
        .unwrap();
    assert_eq!(report.valid_recipients, vec!["b@example.org"]);
    assert_eq!(
        report.invalid_recipients,
        vec![("c@example.org".to_string(), "5.1.1 no such user".to_string())]
    );

    conn.logout().await.unwrap();
    assert_eq!(conn.state(), State::Closed);
}

#[tokio::test]
async fn smtp_falls_back_to_helo() {
    let mock = Builder::new()
        .read(b"220 old server\r\n")
        .write(b"EHLO localhost\r\n")
        .read(b"502 command not implemented\r\n")
        .write(b"HELO localhost\r\n")
        .read(b"250 hello\r\n")
        .build();
    let mut conn = MailConnection::<Smtp>::new(config("smtp.example.com", mock).build().unwrap());

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), State::NotAuthenticated);
    assert!(conn.dialect().auth_mechanisms().is_empty());
    conn.close().await;
}

#[tokio::test]
async fn smtp_rejects_send_when_no_recipient_accepted() {
    let mock = Builder::new()
        .read(b"220 ready\r\n")
        .write(b"EHLO localhost\r\n")
        .read(b"250 smtp.example.com\r\n")
        .write(b"MAIL FROM:<a@example.com>\r\n")
        .read(b"250 ok\r\n")
        .write(b"RCPT TO:<b@example.org>\r\n")
        .read(b"550 rejected\r\n")
        .write(b"RSET\r\n")
        .read(b"250 flushed\r\n")
        .build();
    let mut conn = MailConnection::<Smtp>::new(config("smtp.example.com", mock).build().unwrap());

    conn.connect().await.unwrap();
    let err = conn
        .send_message("a@example.com", &["b@example.org"], b"body")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Command { ref command, .. } if command == "RCPT"));
    conn.close().await;
}

#[tokio::test]
async fn smtp_service_unavailable_greeting() {
    let mock = Builder::new().read(b"554 no service\r\n").build();
    let mut conn = MailConnection::<Smtp>::new(config("smtp.example.com", mock).build().unwrap());

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Greeting(_)));
    assert_eq!(conn.state(), State::Closed);
}

// ---------------------------------------------------------------------------
// POP3
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop3_user_pass_and_quit() {
    let mock = Builder::new()
        .read(b"+OK POP3 server ready\r\n")
        .write(b"USER user\r\n")
        .read(b"+OK\r\n")
        .write(b"PASS secret\r\n")
        .read(b"+OK maildrop locked\r\n")
        .write(b"QUIT\r\n")
        .read(b"+OK bye\r\n")
        .build();
    let mut conn = MailConnection::<Pop3>::new(config("pop.example.com", mock).build().unwrap());

    conn.connect().await.unwrap();
    assert_eq!(conn.greeting(), Some("POP3 server ready"));
    conn.login("secret").await.unwrap();
    assert_eq!(conn.state(), State::Authenticated);
    conn.logout().await.unwrap();
    assert_eq!(conn.state(), State::Closed);
}

#[tokio::test]
async fn pop3_rejected_password_names_pass() {
    let mock = Builder::new()
        .read(b"+OK ready\r\n")
        .write(b"USER user\r\n")
        .read(b"+OK\r\n")
        .write(b"PASS wrong\r\n")
        .read(b"-ERR invalid password\r\n")
        .build();
    let mut conn = MailConnection::<Pop3>::new(config("pop.example.com", mock).build().unwrap());

    conn.connect().await.unwrap();
    let err = conn.login("wrong").await.unwrap_err();
    assert_eq!(err.to_string(), "PASS failed: invalid password");
    assert_eq!(conn.state(), State::NotAuthenticated);
    conn.close().await;
}
