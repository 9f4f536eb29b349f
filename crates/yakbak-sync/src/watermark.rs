//! Per-participant sync watermarks.
//!
//! A watermark `(oldest, newest)` records the time span for which a
//! participant's records are known to be in the local cache. It only ever
//! widens: `newest` never decreases and `oldest` never increases, so late
//! results from a slow catch-up cannot undo progress made by the live tail.
//!
//! The whole table persists as one JSON object under [`THRESHOLDS_KEY`]:
//!
//! ```text
//! { "<participant hex>": [oldest, newest], ... }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use yakbak_core::{ParticipantId, Timestamp};

use crate::Result;
use crate::cache::KvStore;

/// Key/value key holding the serialized table.
pub const THRESHOLDS_KEY: &str = "thresholds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub oldest: Timestamp,
    pub newest: Timestamp,
}

impl Watermark {
    /// Build a watermark, swapping the bounds if they arrive reversed.
    pub fn new(a: Timestamp, b: Timestamp) -> Self {
        Self {
            oldest: a.min(b),
            newest: a.max(b),
        }
    }

    /// Whether `newest` lies within `window_secs` of `now`.
    pub fn is_fresh(&self, now: Timestamp, window_secs: i64) -> bool {
        now - self.newest < window_secs
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ParticipantId, Watermark>,
    dirty: bool,
}

/// In-memory watermark table with explicit persistence.
pub struct WatermarkTable {
    store: Arc<dyn KvStore>,
    inner: Mutex<Inner>,
}

impl WatermarkTable {
    /// Load the table from `store`. Malformed entries are skipped.
    pub fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut entries = HashMap::new();

        if let Some(raw) = store.get(THRESHOLDS_KEY)? {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(serde_json::Value::Object(map)) => {
                    for (key, value) in map {
                        match parse_entry(&key, &value) {
                            Some((participant, watermark)) => {
                                entries.insert(participant, watermark);
                            }
                            None => tracing::debug!("Ignoring watermark entry {}", key),
                        }
                    }
                }
                Ok(_) => tracing::warn!("Watermark table is not a JSON object, starting empty"),
                Err(e) => tracing::warn!("Watermark table unreadable ({}), starting empty", e),
            }
        }

        tracing::debug!("Loaded {} watermarks", entries.len());

        Ok(Self {
            store,
            inner: Mutex::new(Inner {
                entries,
                dirty: false,
            }),
        })
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<Watermark> {
        self.inner.lock().entries.get(participant).copied()
    }

    /// Raise `newest` to `to`. No-op when absent or when `to` is not newer.
    pub fn extend_newest(&self, participant: &ParticipantId, to: Timestamp) -> bool {
        let mut inner = self.inner.lock();
        let changed = match inner.entries.get_mut(participant) {
            Some(wm) if to > wm.newest => {
                wm.newest = to;
                true
            }
            _ => false,
        };
        inner.dirty |= changed;
        changed
    }

    /// Lower `oldest` to `to`. No-op when absent or when `to` is not older.
    pub fn extend_oldest(&self, participant: &ParticipantId, to: Timestamp) -> bool {
        let mut inner = self.inner.lock();
        let changed = match inner.entries.get_mut(participant) {
            Some(wm) if to < wm.oldest => {
                wm.oldest = to;
                true
            }
            _ => false,
        };
        inner.dirty |= changed;
        changed
    }

    /// Create an entry only if the participant has none.
    pub fn initialize_if_absent(
        &self,
        participant: &ParticipantId,
        observed_oldest: Timestamp,
        observed_newest: Timestamp,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(participant) {
            return false;
        }
        inner
            .entries
            .insert(*participant, Watermark::new(observed_oldest, observed_newest));
        inner.dirty = true;
        true
    }

    /// Whether there are changes not yet written by [`WatermarkTable::flush`].
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the table if it changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let snapshot: BTreeMap<String, [Timestamp; 2]> = {
            let mut inner = self.inner.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            inner
                .entries
                .iter()
                .map(|(p, wm)| (p.to_hex(), [wm.oldest, wm.newest]))
                .collect()
        };

        let written = serde_json::to_string(&snapshot)
            .map_err(crate::Error::from)
            .and_then(|json| self.store.put(THRESHOLDS_KEY, &json));

        if let Err(e) = written {
            self.inner.lock().dirty = true;
            metrics::counter!("cache_errors_total").increment(1);
            return Err(e);
        }

        metrics::counter!("watermark_flushes_total").increment(1);
        tracing::debug!("Flushed {} watermarks", snapshot.len());
        Ok(())
    }
}

fn parse_entry(key: &str, value: &serde_json::Value) -> Option<(ParticipantId, Watermark)> {
    let participant = ParticipantId::from_hex(key).ok()?;
    let pair = value.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    let oldest = pair[0].as_i64()?;
    let newest = pair[1].as_i64()?;
    if oldest > newest {
        return None;
    }
    Some((participant, Watermark { oldest, newest }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteEventCache;
    use crate::testing::participant;

    fn table() -> (Arc<SqliteEventCache>, WatermarkTable) {
        let store = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let table = WatermarkTable::load(store.clone()).unwrap();
        (store, table)
    }

    #[test]
    fn test_initialize_only_when_absent() {
        let (_, table) = table();
        let p = participant(1);

        assert!(table.initialize_if_absent(&p, 1000, 2000));
        assert!(!table.initialize_if_absent(&p, 0, 5000));
        assert_eq!(table.get(&p), Some(Watermark::new(1000, 2000)));
    }

    #[test]
    fn test_watermark_never_narrows() {
        let (_, table) = table();
        let p = participant(1);
        table.initialize_if_absent(&p, 1000, 2000);

        assert!(!table.extend_newest(&p, 1500));
        assert!(!table.extend_oldest(&p, 1200));
        assert_eq!(table.get(&p), Some(Watermark::new(1000, 2000)));

        assert!(table.extend_newest(&p, 2200));
        assert!(table.extend_oldest(&p, 900));
        assert_eq!(table.get(&p), Some(Watermark::new(900, 2200)));

        // Any interleaving of updates keeps oldest <= newest and only widens.
        let mut last = table.get(&p).unwrap();
        for ts in [100, 3000, 50, 2999, 5000, 0] {
            table.extend_newest(&p, ts);
            table.extend_oldest(&p, ts);
            let now = table.get(&p).unwrap();
            assert!(now.oldest <= last.oldest && now.newest >= last.newest);
            assert!(now.oldest <= now.newest);
            last = now;
        }
    }

    #[test]
    fn test_extend_absent_is_noop() {
        let (_, table) = table();
        assert!(!table.extend_newest(&participant(9), 100));
        assert!(!table.extend_oldest(&participant(9), 100));
        assert!(table.is_empty());
        assert!(!table.is_dirty());
    }

    #[test]
    fn test_reversed_bounds_are_swapped() {
        let (_, table) = table();
        table.initialize_if_absent(&participant(1), 20, 10);
        assert_eq!(table.get(&participant(1)), Some(Watermark { oldest: 10, newest: 20 }));
    }

    #[test]
    fn test_flush_and_reload() {
        let (store, table) = table();
        let p = participant(1);
        table.initialize_if_absent(&p, 1000, 2000);
        assert!(table.is_dirty());
        table.flush().unwrap();
        assert!(!table.is_dirty());

        let raw = store.get(THRESHOLDS_KEY).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json[p.to_hex()], serde_json::json!([1000, 2000]));

        let reloaded = WatermarkTable::load(store).unwrap();
        assert_eq!(reloaded.get(&p), Some(Watermark::new(1000, 2000)));
    }

    #[test]
    fn test_load_skips_malformed_entries() {
        let store = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let good = participant(1).to_hex();
        let raw = format!(
            r#"{{"{good}":[1,2],"not-hex":[1,2],"{bad}":"x","{rev}":[5,1],"{short}":[1]}}"#,
            bad = participant(2).to_hex(),
            rev = participant(3).to_hex(),
            short = participant(4).to_hex(),
        );
        store.put(THRESHOLDS_KEY, &raw).unwrap();

        let table = WatermarkTable::load(store).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&participant(1)), Some(Watermark::new(1, 2)));
    }

    #[test]
    fn test_load_tolerates_garbage() {
        let store = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        store.put(THRESHOLDS_KEY, "not json").unwrap();
        let table = WatermarkTable::load(store).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_freshness() {
        let wm = Watermark::new(0, 1000);
        assert!(wm.is_fresh(1000 + 7199, 7200));
        assert!(!wm.is_fresh(1000 + 7200, 7200));
    }
}
