//! Parser for `key=value` result listings returned by remote commands.
//!
//! Consecutive `key=value` lines form one record. Any other line, blank or
//! not, ends the current record. Empty records are dropped, and so is any
//! record that lacks the required key.

/// One parsed record; fields keep their input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    /// Returns the first value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All fields in input order.
    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim_end_matches('\r')))
}

/// Parses `input`, calling `emit` for every record that has `required`.
///
/// Returns the number of records emitted.
pub fn parse_records<F>(input: &str, required: &str, mut emit: F) -> usize
where
    F: FnMut(Record),
{
    let mut emitted = 0;
    let mut current = Record::default();
    let mut finish = |record: Record| {
        if record.get(required).is_some() {
            emit(record);
            emitted += 1;
        }
    };

    for line in input.lines() {
        if let Some((key, value)) = split_field(line) {
            current.fields.push((key.to_string(), value.to_string()));
        } else if !current.is_empty() {
            finish(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        finish(current);
    }
    emitted
}

/// Parses `input` and returns the first record that has `required`.
#[must_use]
pub fn parse_single(input: &str, required: &str) -> Option<Record> {
    let mut first = None;
    parse_records(input, required, |record| {
        if first.is_none() {
            first = Some(record);
        }
    });
    first
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

    const LISTING: &str = "id=1\r\nprotocol=milter\r\npeer=10.0.0.1:4000\r\n\r\n\
                           id=2\r\nprotocol=admin\r\n\r\n.\r\n";

    #[test]
    fn test_records_split_on_non_field_lines() {
        let mut records = Vec::new();
        let n = parse_records(LISTING, "id", |r| records.push(r));
        assert_eq!(n, 2);
        assert_eq!(records[0].get("peer"), Some("10.0.0.1:4000"));
        assert_eq!(records[1].get("protocol"), Some("admin"));
        assert_eq!(records[1].len(), 2);
    }

    #[test]
    fn test_separator_need_not_be_blank() {
        let input = "id=1\nname=a\n--\nid=2\nname=b\n";
        let mut ids = Vec::new();
        parse_records(input, "id", |r| ids.push(r.get("id").unwrap().to_string()));
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_record_without_required_key_is_skipped() {
        let input = "name=orphan\n\nid=7\nname=kept\n\n\n\n";
        let mut records = Vec::new();
        parse_records(input, "id", |r| records.push(r));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("name"), Some("kept"));
    }

    #[test]
    fn test_values_may_contain_equals_and_be_empty() {
        let record = parse_single("id=1\nfilter=a=b\nnote=\n", "id").unwrap();
        assert_eq!(record.get("filter"), Some("a=b"));
        assert_eq!(record.get("note"), Some(""));
        assert_eq!(
            record.fields().iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["id", "filter", "note"]
        );
    }

    #[test]
    fn test_parse_single_returns_first() {
        let record = parse_single(LISTING, "id").unwrap();
        assert_eq!(record.get("id"), Some("1"));
        assert!(parse_single("", "id").is_none());
        assert!(parse_single("OK\n", "id").is_none());
    }
}
