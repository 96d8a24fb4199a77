//! SASL security layer stream.
//!
//! After a mechanism negotiates integrity or confidentiality protection, every
//! buffer on the wire is a 4-byte big-endian length followed by that many
//! wrapped bytes (RFC 4422 section 3.7).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::Result;

/// Length of the frame prefix.
const LENGTH_PREFIX: usize = 4;

/// Read chunk size for the underlying transport.
const READ_CHUNK: usize = 4096;

/// Wraps and unwraps buffers for a negotiated SASL security layer.
pub trait SecurityLayer: Send {
    /// Protects outgoing plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot protect the buffer.
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Verifies and decodes one incoming frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if integrity verification or decryption fails.
    fn unwrap(&mut self, wrapped: &[u8]) -> Result<Vec<u8>>;

    /// Largest frame body either side may send.
    fn max_buffer_size(&self) -> usize;
}

/// Stream that applies a [`SecurityLayer`] to an underlying transport.
pub struct SaslStream<S> {
    inner: S,
    layer: Box<dyn SecurityLayer>,
    /// Raw frames read from the transport, not yet unwrapped.
    incoming: BytesMut,
    /// Unwrapped bytes waiting for the reader.
    plaintext: BytesMut,
    /// Wrapped frames waiting to be written.
    outgoing: BytesMut,
}

impl<S> std::fmt::Debug for SaslStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslStream")
            .field("incoming", &self.incoming.len())
            .field("plaintext", &self.plaintext.len())
            .field("outgoing", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

impl<S> SaslStream<S> {
    /// Wraps `inner` with the given security layer.
    pub fn new(inner: S, layer: Box<dyn SecurityLayer>) -> Self {
        Self {
            inner,
            layer,
            incoming: BytesMut::new(),
            plaintext: BytesMut::new(),
            outgoing: BytesMut::new(),
        }
    }

    /// Returns a reference to the underlying transport.
    pub const fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Extracts one complete frame from `incoming`, if present.
    fn take_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.incoming.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([
            self.incoming[0],
            self.incoming[1],
            self.incoming[2],
            self.incoming[3],
        ]) as usize;
        if declared > self.layer.max_buffer_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "SASL frame of {declared} bytes exceeds buffer size {}",
                    self.layer.max_buffer_size()
                ),
            ));
        }
        if self.incoming.len() < LENGTH_PREFIX + declared {
            return Ok(None);
        }
        self.incoming.advance(LENGTH_PREFIX);
        let body = self.incoming.split_to(declared);
        self.layer
            .unwrap(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<S: AsyncWrite + Unpin> SaslStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outgoing.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outgoing))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outgoing.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SaslStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plaintext.is_empty() {
                let n = this.plaintext.len().min(buf.remaining());
                buf.put_slice(&this.plaintext.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if let Some(frame) = this.take_frame()? {
                this.plaintext.extend_from_slice(&frame);
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            if read.filled().is_empty() {
                if this.incoming.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a SASL frame",
                )));
            }
            this.incoming.extend_from_slice(read.filled());
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SaslStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let n = buf.len().min(this.layer.max_buffer_size());
        let wrapped = this
            .layer
            .wrap(&buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(wrapped.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "wrapped frame too large"))?;
        this.outgoing.reserve(LENGTH_PREFIX + wrapped.len());
        this.outgoing.put_u32(len);
        this.outgoing.put_slice(&wrapped);

        // The bytes are accepted; a pending drain completes on flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Toy confidentiality layer: XOR with a fixed key.
    struct XorLayer(u8, usize);

    impl SecurityLayer for XorLayer {
        fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
            Ok(plaintext.iter().map(|b| b ^ self.0).collect())
        }

        fn unwrap(&mut self, wrapped: &[u8]) -> Result<Vec<u8>> {
            Ok(wrapped.iter().map(|b| b ^ self.0).collect())
        }

        fn max_buffer_size(&self) -> usize {
            self.1
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_layer() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = SaslStream::new(a, Box::new(XorLayer(0x5a, 64)));
        let mut server = SaslStream::new(b, Box::new(XorLayer(0x5a, 64)));

        client.write_all(b"a1 NOOP\r\n").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a1 NOOP\r\n");
    }

    #[tokio::test]
    async fn test_wire_format_is_length_prefixed() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut client = SaslStream::new(a, Box::new(XorLayer(0x01, 64)));

        client.write_all(b"hi").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = [0u8; 6];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0, 0, 0, 2, b'h' ^ 1, b'i' ^ 1]);
    }

    #[tokio::test]
    async fn test_large_write_is_split_into_frames() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = SaslStream::new(a, Box::new(XorLayer(0x33, 16)));
        let mut server = SaslStream::new(b, Box::new(XorLayer(0x33, 16)));

        let payload: Vec<u8> = (0..100u8).collect();
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut client = SaslStream::new(a, Box::new(XorLayer(0, 8)));

        raw.write_all(&[0, 0, 0, 9]).await.unwrap();
        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_error() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut client = SaslStream::new(a, Box::new(XorLayer(0, 64)));

        raw.write_all(&[0, 0, 0, 4, 1, 2]).await.unwrap();
        drop(raw);
        let mut buf = [0u8; 4];
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
