//! IMAP command tag generator.
//!
//! Tags are used to match commands with their responses.

/// Tag generator for IMAP commands.
///
/// Generates sequential tags in the format "A0001", "A0002", etc.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    counter: u32,
    prefix: char,
}

impl TagGenerator {
    /// Creates a new tag generator with the given prefix.
    #[must_use]
    pub const fn new(prefix: char) -> Self {
        Self { counter: 0, prefix }
    }

    /// Generates the next tag.
    ///
    /// The counter wraps instead of failing; tags only need to be unique
    /// among outstanding commands.
    pub fn next_tag(&mut self) -> String {
        self.counter = self.counter.wrapping_add(1);
        format!("{}{:04}", self.prefix, self.counter)
    }

    /// Returns the number of tags issued so far.
    #[must_use]
    pub const fn issued(&self) -> u32 {
        self.counter
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new('A')
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

    #[test]
    fn test_sequential_tags() {
        let mut tags = TagGenerator::default();
        assert_eq!(tags.next_tag(), "A0001");
        assert_eq!(tags.next_tag(), "A0002");
        assert_eq!(tags.issued(), 2);
    }

    #[test]
    fn test_custom_prefix() {
        let mut tags = TagGenerator::new('Z');
        assert_eq!(tags.next_tag(), "Z0001");
    }

    #[test]
    fn test_wide_counter() {
        let mut tags = TagGenerator::default();
        tags.counter = 99_999;
        assert_eq!(tags.next_tag(), "A100000");
    }

    #[test]
    fn test_wraps_without_panicking() {
        let mut tags = TagGenerator::default();
        tags.counter = u32::MAX;
        assert_eq!(tags.next_tag(), "A0000");
    }
}
