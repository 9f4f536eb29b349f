//! Query filters.
//!
//! A [`Filter`] doubles as the wire query sent to relays and as the local
//! predicate deciding whether a record belongs to a feed. `None` means
//! "unconstrained"; `Some(empty set)` matches nothing.

use std::collections::{BTreeMap, BTreeSet};

use crate::record::{ParticipantId, Record, RecordId, Timestamp};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<RecordId>>,
    pub authors: Option<BTreeSet<ParticipantId>>,
    pub kinds: Option<BTreeSet<u16>>,
    /// Single-letter tag constraints (`#e`, `#p`, `#t`, ...).
    pub tags: BTreeMap<char, BTreeSet<String>>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: RecordId) -> Self {
        self.ids([id])
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).extend(ids);
        self
    }

    pub fn author(self, author: ParticipantId) -> Self {
        self.authors([author])
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = ParticipantId>) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).extend(authors);
        self
    }

    pub fn kind(self, kind: u16) -> Self {
        self.kinds([kind])
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Require a tag named `letter` with one of `values`.
    pub fn tag<S: Into<String>>(mut self, letter: char, values: impl IntoIterator<Item = S>) -> Self {
        self.tags
            .entry(letter)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Replace the author constraint.
    pub fn with_authors(mut self, authors: impl IntoIterator<Item = ParticipantId>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    /// A filter constraint set that no record can satisfy.
    pub fn is_unsatisfiable(&self) -> bool {
        self.ids.as_ref().is_some_and(BTreeSet::is_empty)
            || self.authors.as_ref().is_some_and(BTreeSet::is_empty)
            || self.kinds.as_ref().is_some_and(BTreeSet::is_empty)
            || self.tags.values().any(BTreeSet::is_empty)
            || matches!((self.since, self.until), (Some(s), Some(u)) if s > u)
    }

    /// Whether `record` satisfies every constraint. `limit` is ignored.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&record.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&record.author)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&record.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| record.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(letter, values)| {
            let mut buf = [0u8; 4];
            let name: &str = letter.encode_utf8(&mut buf);
            record.tag_values(name).any(|v| values.contains(v))
        })
    }
}

/// Split user input into hashtags: whitespace or comma separated, one leading
/// `#` stripped, empties dropped.
pub fn parse_hashtags(input: &str) -> Vec<String> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|part| part.strip_prefix('#').unwrap_or(part))
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(author: u8, created_at: Timestamp, kind: u16, tags: &[(&str, &str)]) -> Record {
        Record {
            id: RecordId::from_bytes([created_at as u8; 32]),
            author: ParticipantId::from_bytes([author; 32]),
            created_at,
            kind,
            tags: tags
                .iter()
                .map(|(k, v)| vec![k.to_string(), v.to_string()])
                .collect(),
            content: String::new(),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&record(1, 10, 1222, &[])));
        assert!(!Filter::new().is_unsatisfiable());
    }

    #[test]
    fn test_author_and_kind() {
        let filter = Filter::new()
            .author(ParticipantId::from_bytes([1; 32]))
            .kind(1222);
        assert!(filter.matches(&record(1, 10, 1222, &[])));
        assert!(!filter.matches(&record(2, 10, 1222, &[])));
        assert!(!filter.matches(&record(1, 10, 1244, &[])));
    }

    #[test]
    fn test_time_bounds_are_inclusive() {
        let filter = Filter::new().since(10).until(20);
        assert!(filter.matches(&record(1, 10, 1, &[])));
        assert!(filter.matches(&record(1, 20, 1, &[])));
        assert!(!filter.matches(&record(1, 9, 1, &[])));
        assert!(!filter.matches(&record(1, 21, 1, &[])));
    }

    #[test]
    fn test_tag_constraint() {
        let filter = Filter::new().tag('t', ["music", "jazz"]);
        assert!(filter.matches(&record(1, 1, 1, &[("t", "jazz")])));
        assert!(!filter.matches(&record(1, 1, 1, &[("t", "rock")])));
        assert!(!filter.matches(&record(1, 1, 1, &[("p", "jazz")])));
    }

    #[test]
    fn test_empty_author_set_is_unsatisfiable() {
        let filter = Filter::new().with_authors(Vec::new());
        assert!(filter.is_unsatisfiable());
        assert!(!filter.matches(&record(1, 1, 1, &[])));
        assert!(Filter::new().since(5).until(4).is_unsatisfiable());
    }

    #[test]
    fn test_parse_hashtags() {
        assert_eq!(
            parse_hashtags("#music, jazz  #blues,,#"),
            vec!["music", "jazz", "blues"]
        );
        assert!(parse_hashtags("  ").is_empty());
    }
}
