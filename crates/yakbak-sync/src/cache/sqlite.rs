//! SQLite implementation of [`EventCache`] and [`KvStore`].

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use yakbak_core::{Filter, ParticipantId, Record, RecordId};

use super::{EventCache, InsertOutcome, KvStore, schema};
use crate::{Error, Result};

/// Record cache backed by one SQLite database.
pub struct SqliteEventCache {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
}

impl SqliteEventCache {
    /// Open or create the cache at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of cached records.
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64
    }
}

impl EventCache for SqliteEventCache {
    fn insert(&self, record: &Record) -> Result<InsertOutcome> {
        let tags_json = serde_json::to_string(&record.tags)?;
        let id = &record.id.as_bytes()[..];

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "INSERT OR IGNORE INTO events (id, author, created_at, kind, tags, content, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                &record.author.as_bytes()[..],
                record.created_at,
                record.kind,
                tags_json,
                record.content,
                Self::unix_now(),
            ],
        )?;

        if changed == 0 {
            return Ok(InsertOutcome::AlreadyExists);
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)",
            )?;
            for tag in &record.tags {
                if tag.len() >= 2 && tag[0].chars().count() == 1 {
                    stmt.execute(params![id, tag[0], tag[1]])?;
                }
            }
        }

        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    fn query_range(&self, filter: &Filter, limit: usize) -> Result<Vec<Record>> {
        let limit = filter.limit.map_or(limit, |l| l.min(limit));
        if limit == 0 || filter.is_unsatisfiable() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT e.id, e.author, e.created_at, e.kind, e.tags, e.content FROM events e WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(ids) = &filter.ids {
            sql.push_str(&format!(" AND e.id IN ({})", placeholders(ids.len())));
            values.extend(ids.iter().map(|id| Value::Blob(id.as_bytes().to_vec())));
        }
        if let Some(authors) = &filter.authors {
            sql.push_str(&format!(" AND e.author IN ({})", placeholders(authors.len())));
            values.extend(authors.iter().map(|a| Value::Blob(a.as_bytes().to_vec())));
        }
        if let Some(kinds) = &filter.kinds {
            sql.push_str(&format!(" AND e.kind IN ({})", placeholders(kinds.len())));
            values.extend(kinds.iter().map(|k| Value::Integer(i64::from(*k))));
        }
        for (letter, tag_values) in &filter.tags {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM event_tags t WHERE t.event_id = e.id AND t.name = ? AND t.value IN ({}))",
                placeholders(tag_values.len())
            ));
            values.push(Value::Text(letter.to_string()));
            values.extend(tag_values.iter().cloned().map(Value::Text));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND e.created_at >= ?");
            values.push(Value::Integer(since));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND e.created_at <= ?");
            values.push(Value::Integer(until));
        }
        sql.push_str(" ORDER BY e.created_at DESC, e.id ASC LIMIT ?");
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(RawRow {
                id: row.get(0)?,
                author: row.get(1)?,
                created_at: row.get(2)?,
                kind: row.get(3)?,
                tags: row.get(4)?,
                content: row.get(5)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn get_by_ids(&self, ids: &[RecordId]) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.query_range(&Filter::new().ids(ids.iter().copied()), ids.len())
    }
}

impl KvStore for SqliteEventCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, Self::unix_now()],
        )?;
        Ok(())
    }
}

struct RawRow {
    id: Vec<u8>,
    author: Vec<u8>,
    created_at: i64,
    kind: u16,
    tags: String,
    content: String,
}

impl RawRow {
    fn into_record(self) -> Result<Record> {
        let id: [u8; 32] = self
            .id
            .try_into()
            .map_err(|_| Error::Database("corrupt id column".to_string()))?;
        let author: [u8; 32] = self
            .author
            .try_into()
            .map_err(|_| Error::Database("corrupt author column".to_string()))?;

        Ok(Record {
            id: RecordId::from_bytes(id),
            author: ParticipantId::from_bytes(author),
            created_at: self.created_at,
            kind: self.kind,
            tags: serde_json::from_str(&self.tags)?,
            content: self.content,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
