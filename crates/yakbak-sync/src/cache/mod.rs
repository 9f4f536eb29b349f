//! Local persistent record cache and key/value store.
//!
//! The cache is the canonical deduplication point: every record arriving from
//! the network is offered to [`EventCache::insert`], and only
//! [`InsertOutcome::Inserted`] records are treated as new.

mod schema;
mod sqlite;

use yakbak_core::{Filter, Record, RecordId};

use crate::Result;

pub use sqlite::SqliteEventCache;

/// Whether an insert stored something new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

impl InsertOutcome {
    pub fn is_new(self) -> bool {
        self == Self::Inserted
    }
}

/// Persistent, deduplicating, range-queryable record store.
///
/// Calls are synchronous and short; implementations must not block on the
/// network.
pub trait EventCache: Send + Sync {
    /// Store `record` unless a record with the same id is already present.
    fn insert(&self, record: &Record) -> Result<InsertOutcome>;

    /// Records matching `filter`, most recent first, at most `limit`.
    fn query_range(&self, filter: &Filter, limit: usize) -> Result<Vec<Record>>;

    /// Records with the given ids, in no particular order.
    fn get_by_ids(&self, ids: &[RecordId]) -> Result<Vec<Record>>;
}

/// Small string key/value persistence (watermarks, last-seen markers).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}
