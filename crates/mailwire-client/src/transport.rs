//! Framed line I/O over the current transport stream.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use mailwire_codec::{Frame, LineDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::reply::{Classified, Reply};
use crate::stream::BoxStream;
use crate::{Dialect, Error, Result};

/// Read chunk reserved before each socket read.
const READ_CHUNK: usize = 8192;

/// Buffered line transport.
///
/// The stream sits in an `Option` so STARTTLS and SASL layers can take it,
/// wrap it and put the wrapped stream back in one step.
pub(crate) struct Transport {
    stream: Option<BoxStream>,
    decoder: LineDecoder,
    buffer: BytesMut,
    read_timeout: Duration,
}

impl Transport {
    pub(crate) fn new(stream: BoxStream, decoder: LineDecoder, read_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            decoder,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            read_timeout,
        }
    }

    /// Writes one line followed by CRLF.
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write_raw(&data).await
    }

    /// Writes raw bytes and flushes.
    pub(crate) async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads the next frame, waiting at most the read timeout per socket read.
    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let stream = self.stream.as_mut().ok_or(Error::Closed)?;
            self.buffer.reserve(READ_CHUNK);
            let read = tokio::time::timeout(self.read_timeout, stream.read_buf(&mut self.buffer))
                .await
                .map_err(|_| Error::Timeout(self.read_timeout))??;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )
                .into());
            }
        }
    }

    /// Reads one complete reply, classifying each line with the dialect.
    ///
    /// Lines that follow a literal continue the data line the literal belongs to.
    pub(crate) async fn read_reply<D: Dialect>(
        &mut self,
        dialect: &D,
        tag: Option<&str>,
    ) -> Result<Reply> {
        let mut data: Vec<String> = Vec::new();
        let mut literals = Vec::new();
        let mut after_literal = false;

        loop {
            match self.read_frame().await? {
                Frame::Literal(bytes) => {
                    trace!(size = bytes.len(), "S: <literal>");
                    literals.push(bytes);
                    after_literal = true;
                }
                Frame::Line(line) => {
                    trace!("S: {line}");
                    if after_literal {
                        after_literal = false;
                        if let Some(last) = data.last_mut() {
                            last.push_str(&line);
                            continue;
                        }
                    }
                    match dialect.classify(tag, &line)? {
                        Classified::Data(text) => data.push(text),
                        Classified::Done { status, code, text } => {
                            return Ok(Reply {
                                status,
                                code,
                                text,
                                line,
                                data,
                                literals,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Removes the stream for wrapping.
    ///
    /// Fails if the server already sent bytes that would have to be read
    /// through the old stream.
    pub(crate) fn take_stream(&mut self) -> Result<BoxStream> {
        if !self.buffer.is_empty() || self.decoder.in_literal() {
            return Err(Error::Parse(
                "server sent data before the stream could be wrapped".into(),
            ));
        }
        self.stream.take().ok_or(Error::Closed)
    }

    /// Installs a wrapped stream.
    pub(crate) fn put_stream(&mut self, stream: BoxStream) {
        self.stream = Some(stream);
    }

    /// Shuts down and drops the stream.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }
}
