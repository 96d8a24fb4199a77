//! Line decoder with literal support.
//!
//! Mail protocols send LF-terminated lines; a CR immediately before the LF
//! belongs to the terminator, a lone CR anywhere else is content. IMAP also
//! lets a line end in `{N}` or `{N+}` to announce N raw bytes that follow the
//! terminator. The decoder emits the line first, then the literal bytes as a
//! separate [`Frame::Literal`], then resumes line mode.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::literal::{Literal, parse_literal};
use crate::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_LITERAL_SIZE, DecodeError};

/// A decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text line without its terminator.
    Line(String),
    /// Literal bytes announced by the preceding line.
    Literal(Bytes),
}

impl Frame {
    /// Returns the line text, if this is a line.
    #[must_use]
    pub fn as_line(&self) -> Option<&str> {
        match self {
            Self::Line(line) => Some(line),
            Self::Literal(_) => None,
        }
    }
}

/// Most buffer space reserved ahead of literal bytes that have not arrived.
const LITERAL_RESERVE_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Scanning for the next line terminator.
    Line,
    /// Collecting the bytes of an accepted literal.
    Literal(usize),
    /// Dropping the bytes of a rejected non-synchronizing literal.
    Discard(usize),
    /// Dropping the tail of an overlong line up to its terminator.
    SkipLine,
}

/// Incremental decoder for CRLF/LF lines and IMAP literals.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    max_line_length: usize,
    max_literal_size: usize,
    literals: bool,
    mode: Mode,
    /// Bytes at the front of the buffer already searched for a terminator.
    scanned: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_LITERAL_SIZE)
    }
}

impl LineDecoder {
    /// Creates a decoder with the given line and literal limits.
    #[must_use]
    pub const fn new(max_line_length: usize, max_literal_size: usize) -> Self {
        Self {
            max_line_length,
            max_literal_size,
            literals: true,
            mode: Mode::Line,
            scanned: 0,
        }
    }

    /// Disables literal detection; every line is plain text.
    ///
    /// POP3, SMTP and the admin channel have no literal syntax, so a line that
    /// happens to end in `{N}` must not switch the decoder to binary mode.
    #[must_use]
    pub const fn without_literals(mut self) -> Self {
        self.literals = false;
        self
    }

    /// Returns the configured maximum line length.
    #[must_use]
    pub const fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    /// Returns the configured maximum literal size.
    #[must_use]
    pub const fn max_literal_size(&self) -> usize {
        self.max_literal_size
    }

    /// Returns true if the decoder is in the middle of a literal.
    #[must_use]
    pub const fn in_literal(&self) -> bool {
        matches!(self.mode, Mode::Literal(_))
    }

    /// Returns the number of literal bytes still expected, if any.
    #[must_use]
    pub const fn pending_literal(&self) -> Option<usize> {
        match self.mode {
            Mode::Literal(n) => Some(n),
            _ => None,
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        let Some(offset) = src[self.scanned..].iter().position(|&b| b == b'\n') else {
            // A CR may still be waiting for its LF, so allow one extra byte.
            if src.len() > self.max_line_length.saturating_add(1) {
                debug!(buffered = src.len(), "discarding overlong line");
                src.clear();
                self.scanned = 0;
                self.mode = Mode::SkipLine;
                return Err(DecodeError::LineTooLong {
                    limit: self.max_line_length,
                });
            }
            self.scanned = src.len();
            return Ok(None);
        };

        let newline = self.scanned + offset;
        self.scanned = 0;
        let raw = src.split_to(newline + 1);
        let mut end = newline;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
        let content = &raw[..end];

        if content.len() > self.max_line_length {
            return Err(DecodeError::LineTooLong {
                limit: self.max_line_length,
            });
        }

        let line = String::from_utf8_lossy(content).into_owned();
        if !self.literals {
            return Ok(Some(Frame::Line(line)));
        }
        match parse_literal(content) {
            Ok(None) => {}
            Ok(Some(Literal {
                size,
                non_synchronizing,
            })) => {
                if size > self.max_literal_size {
                    if non_synchronizing {
                        self.mode = Mode::Discard(size);
                    }
                    return Err(DecodeError::LiteralTooBig {
                        line,
                        size,
                        limit: self.max_literal_size,
                    });
                }
                trace!(size, "literal announced");
                self.mode = Mode::Literal(size);
            }
            Err(_) => return Err(DecodeError::InvalidLiteral { line }),
        }

        Ok(Some(Frame::Line(line)))
    }
}

impl Decoder for LineDecoder {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            match self.mode {
                Mode::Line => return self.decode_line(src),
                Mode::Literal(size) => {
                    if src.len() < size {
                        src.reserve((size - src.len()).min(LITERAL_RESERVE_CHUNK));
                        return Ok(None);
                    }
                    self.mode = Mode::Line;
                    return Ok(Some(Frame::Literal(src.split_to(size).freeze())));
                }
                Mode::Discard(remaining) => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.mode = Mode::Discard(remaining - n);
                        return Ok(None);
                    }
                    self.mode = Mode::Line;
                }
                Mode::SkipLine => {
                    if let Some(pos) = src.iter().position(|&b| b == b'\n') {
                        src.advance(pos + 1);
                        self.mode = Mode::Line;
                    } else {
                        src.clear();
                        return Ok(None);
                    }
                }
            }
        }
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

    fn line(s: &str) -> Frame {
        Frame::Line(s.to_string())
    }

    fn literal(b: &[u8]) -> Frame {
        Frame::Literal(Bytes::copy_from_slice(b))
    }

    fn drain(decoder: &mut LineDecoder, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_crlf_and_lf_terminators() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"A1 NOOP\r\nA2 NOOP\n\r\n"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![line("A1 NOOP"), line("A2 NOOP"), line("")]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bare_cr_is_content() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"a\rb\r\n"[..]);
        assert_eq!(drain(&mut decoder, &mut buf), vec![line("a\rb")]);
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"A1 LOG"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"A1 LOG");
        buf.extend_from_slice(b"IN a b\r");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(line("A1 LOGIN a b")));
    }

    #[test]
    fn test_literal_in_separate_read() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"A1 APPEND INBOX {5}\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(line("A1 APPEND INBOX {5}"))
        );
        assert!(decoder.in_literal());
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"he");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"llo\r\n");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(literal(b"hello")));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(line("")));
    }

    #[test]
    fn test_announced_literal_does_not_preallocate() {
        let mut decoder = LineDecoder::new(DEFAULT_MAX_LINE_LENGTH, 200 * 1024 * 1024);
        let mut buf = BytesMut::from(&b"A1 APPEND INBOX {104857600}\r\n"[..]);
        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Frame::Line(_))));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() < 1024 * 1024, "reserved {}", buf.capacity());

        buf.extend_from_slice(&[b'x'; 4096]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() < 1024 * 1024, "reserved {}", buf.capacity());
        assert!(decoder.in_literal());
    }

    #[test]
    fn test_zero_length_literal() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"A1 APPEND INBOX {0+}\r\nA2 NOOP\r\n"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![line("A1 APPEND INBOX {0+}"), literal(b""), line("A2 NOOP")]
        );
    }

    #[test]
    fn test_literal_bytes_are_not_scanned_for_terminators() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"* 1 FETCH (BODY {4}\r\n\r\n\r\n)\r\n"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![line("* 1 FETCH (BODY {4}"), literal(b"\r\n\r\n"), line(")")]
        );
    }

    #[test]
    fn test_line_too_long_then_recovers() {
        let mut decoder = LineDecoder::new(8, 100);
        let mut buf = BytesMut::from(&b"0123456789abc\r\nA1 NOOP\r\n"[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::LineTooLong { limit: 8 }));
        assert!(err.is_recoverable());
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(line("A1 NOOP")));
    }

    #[test]
    fn test_unterminated_overlong_line_skips_to_next_terminator() {
        let mut decoder = LineDecoder::new(8, 100);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(DecodeError::LineTooLong { .. })
        ));
        buf.extend_from_slice(b"still the same line\r\nA2 OK\r\n");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(line("A2 OK")));
    }

    #[test]
    fn test_invalid_literal_then_recovers() {
        let mut decoder = LineDecoder::default();
        let mut buf = BytesMut::from(&b"A1 APPEND INBOX {-1}\r\nA2 NOOP\r\n"[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLiteral { ref line } if line == "A1 APPEND INBOX {-1}"));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(line("A2 NOOP")));
    }

    #[test]
    fn test_literal_too_big_synchronizing_keeps_following_line() {
        let mut decoder = LineDecoder::new(1024, 10);
        let mut buf = BytesMut::from(&b"A1 APPEND INBOX {11}\r\nA2 NOOP\r\n"[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        match err {
            DecodeError::LiteralTooBig { line, size, limit } => {
                assert_eq!(line, "A1 APPEND INBOX {11}");
                assert_eq!(size, 11);
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(line("A2 NOOP")));
    }

    #[test]
    fn test_literal_too_big_non_synchronizing_discards_payload() {
        let mut decoder = LineDecoder::new(1024, 4);
        let mut buf = BytesMut::from(&b"A1 APPEND INBOX {6+}\r\nabc"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(DecodeError::LiteralTooBig { size: 6, .. })
        ));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"def\r\nA2 NOOP\r\n");
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![line(""), line("A2 NOOP")]
        );
    }

    #[test]
    fn test_without_literals_keeps_braces_as_text() {
        let mut decoder = LineDecoder::default().without_literals();
        let mut buf = BytesMut::from(&b"+OK 2 messages {5}\r\nhello\r\n"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![line("+OK 2 messages {5}"), line("hello")]
        );
        assert!(!decoder.in_literal());
    }
}
