//! Transport streams and socket factories.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::Result;

/// Boxed future returned by [`SocketFactory::connect`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Byte stream usable as a mail transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased transport. Plaintext, TLS and SASL-wrapped streams all box into this.
pub type BoxStream = Box<dyn AsyncStream>;

/// Opens transport sockets.
///
/// The default [`TcpSocketFactory`] dials TCP; tests and proxies substitute their own.
pub trait SocketFactory: Send + Sync {
    /// Connects to `host:port`.
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxStream>>;
}

/// Plain TCP socket factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(async move {
            let tcp = TcpStream::connect((host, port)).await?;
            tcp.set_nodelay(true)?;
            Ok(Box::new(tcp) as BoxStream)
        })
    }
}

/// Creates a TLS client configuration with the webpki root certificates.
#[must_use]
pub fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
}

/// Runs a TLS client handshake over `stream`.
///
/// # Errors
///
/// Returns an error if the host is not a valid server name or the handshake fails.
pub async fn upgrade_to_tls(
    stream: BoxStream,
    host: &str,
    tls_config: Arc<rustls::ClientConfig>,
) -> Result<BoxStream> {
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = connector.connect(server_name, stream).await?;
    Ok(Box::new(tls))
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

    #[test]
    fn test_default_tls_config_has_roots() {
        let config = default_tls_config();
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_server_name_is_rejected() {
        let (client, _server) = tokio::io::duplex(64);
        let err = upgrade_to_tls(Box::new(client), "not a host name!", default_tls_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::InvalidDnsName(_)));
    }

    #[tokio::test]
    async fn test_tcp_factory_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = TcpSocketFactory.connect("127.0.0.1", port).await;
        assert!(stream.is_ok());
        accept.await.unwrap();
    }
}
