//! IMAP literal marker parsing.

/// A literal announced at the end of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal {
    /// Number of bytes that follow the line.
    pub size: usize,
    /// True for `{N+}`: the peer sends the bytes without waiting for a
    /// continuation request.
    pub non_synchronizing: bool,
}

/// Error returned for a marker that is shaped like a literal but unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidLiteral;

/// Largest literal length the wire format allows (`2^31 - 1`).
const MAX_WIRE_LITERAL: u64 = i32::MAX as u64;

/// Parses a literal marker from the end of a line (terminator already removed).
///
/// Matches `{123}` and `{123+}`. Lines that do not end in a brace group, or
/// whose brace group is not numeric, carry no literal and yield `Ok(None)`.
/// A negative length or one above `2^31 - 1` is reported as an error.
///
/// # Errors
///
/// Returns [`InvalidLiteral`] for negative or out-of-range lengths.
pub fn parse_literal(line: &[u8]) -> Result<Option<Literal>, InvalidLiteral> {
    let Some(body) = line.strip_suffix(b"}") else {
        return Ok(None);
    };
    let Some(open) = body.iter().rposition(|&b| b == b'{') else {
        return Ok(None);
    };

    let mut digits = &body[open + 1..];
    let non_synchronizing = if let Some(rest) = digits.strip_suffix(b"+") {
        digits = rest;
        true
    } else {
        false
    };

    let (negative, digits) = match digits.strip_prefix(b"-") {
        Some(rest) => (true, rest),
        None => (false, digits),
    };

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Ok(None);
    }
    if negative {
        return Err(InvalidLiteral);
    }

    let mut size: u64 = 0;
    for &d in digits {
        size = size
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(d - b'0')))
            .ok_or(InvalidLiteral)?;
        if size > MAX_WIRE_LITERAL {
            return Err(InvalidLiteral);
        }
    }

    let size = usize::try_from(size).map_err(|_| InvalidLiteral)?;
    Ok(Some(Literal {
        size,
        non_synchronizing,
    }))
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

    fn size_of(line: &[u8]) -> Option<usize> {
        parse_literal(line).unwrap().map(|l| l.size)
    }

    #[test]
    fn test_parse_literal_length() {
        assert_eq!(size_of(b"BODY {123}"), Some(123));
        assert_eq!(size_of(b"BODY {123+}"), Some(123));
        assert_eq!(size_of(b"{0}"), Some(0));
        assert_eq!(size_of(b"{999999}"), Some(999_999));
        assert_eq!(size_of(b"no literal"), None);
        assert_eq!(size_of(b"incomplete {123"), None);
        assert_eq!(size_of(b"wrong {abc}"), None);
        assert_eq!(size_of(b"empty {}"), None);
        assert_eq!(size_of(b"{+}"), None);
    }

    #[test]
    fn test_non_synchronizing_flag() {
        let lit = parse_literal(b"A1 APPEND INBOX {5+}").unwrap().unwrap();
        assert!(lit.non_synchronizing);
        let lit = parse_literal(b"A1 APPEND INBOX {5}").unwrap().unwrap();
        assert!(!lit.non_synchronizing);
    }

    #[test]
    fn test_negative_literal_is_invalid() {
        assert_eq!(parse_literal(b"A1 APPEND INBOX {-1}"), Err(InvalidLiteral));
        assert_eq!(parse_literal(b"A1 APPEND INBOX {-20+}"), Err(InvalidLiteral));
    }

    #[test]
    fn test_literal_above_i32_max_is_invalid() {
        assert!(parse_literal(b"{2147483647}").unwrap().is_some());
        assert_eq!(parse_literal(b"{2147483648}"), Err(InvalidLiteral));
        assert_eq!(
            parse_literal(b"{99999999999999999999999999}"),
            Err(InvalidLiteral)
        );
    }
}
