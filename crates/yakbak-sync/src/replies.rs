//! Thread loading: replies to a record and point lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use yakbak_core::{Endpoint, Filter, Record, RecordId, VOICE_REPLY_KIND};

use crate::cache::EventCache;
use crate::config::SyncConfig;
use crate::directory::EndpointDirectory;
use crate::fanout::Fanout;
use crate::{Error, Result};

/// Maximum replies fetched for one parent.
pub const REPLY_LIMIT: usize = 30;

/// Loads replies and single records, cache first where possible.
///
/// Reply queries go to the parent author's read endpoints. Each endpoint
/// serves one reply query at a time so opening a long feed does not flood a
/// relay with one request per visible record.
pub struct ThreadLoader {
    fanout: Fanout,
    cache: Arc<dyn EventCache>,
    directory: Arc<dyn EndpointDirectory>,
    timeout: Duration,
    cap: usize,
    /// Fallback endpoints for point lookups with no better hint.
    lookup_endpoints: Vec<Endpoint>,
    permits: Mutex<HashMap<Endpoint, Arc<Semaphore>>>,
}

impl ThreadLoader {
    pub fn new(
        fanout: Fanout,
        cache: Arc<dyn EventCache>,
        directory: Arc<dyn EndpointDirectory>,
        config: &SyncConfig,
        lookup_endpoints: Vec<Endpoint>,
    ) -> Self {
        Self {
            fanout,
            cache,
            directory,
            timeout: config.query_timeout,
            cap: config.outbox_cap,
            lookup_endpoints,
            permits: Mutex::new(HashMap::new()),
        }
    }

    /// Replies to `parent`, oldest first.
    pub async fn load_replies(&self, parent: &Record) -> Result<Vec<Record>> {
        let mut inbox = self.directory.read_endpoints(&parent.author).await?;
        inbox.truncate(self.cap);
        if inbox.is_empty() {
            return Ok(Vec::new());
        }

        let filter = Filter::new()
            .kind(VOICE_REPLY_KIND)
            .tag('e', [parent.id.to_hex()])
            .limit(REPLY_LIMIT);

        let permits = self.acquire(&inbox).await;
        let result = self.fanout.query(&inbox, &filter, self.timeout).await;
        drop(permits);

        let mut replies: Vec<Record> = result
            .records
            .into_iter()
            .filter(|r| r.kind == VOICE_REPLY_KIND && r.id != parent.id)
            .collect();
        for reply in &replies {
            if let Err(e) = self.cache.insert(reply) {
                tracing::debug!("Not caching reply {}: {}", reply.id.short(), e);
            }
        }
        replies.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        tracing::debug!(
            "{} replies to {} from {} endpoints",
            replies.len(),
            parent.id.short(),
            inbox.len()
        );
        Ok(replies)
    }

    /// One record by id: the cache first, then the network.
    pub async fn fetch_record(&self, id: &RecordId, hints: &[Endpoint]) -> Result<Record> {
        if let Some(record) = self.cache.get_by_ids(&[*id])?.into_iter().next() {
            return Ok(record);
        }

        let mut endpoints = hints.to_vec();
        for endpoint in &self.lookup_endpoints {
            if !endpoints.contains(endpoint) {
                endpoints.push(endpoint.clone());
            }
        }

        let filter = Filter::new().id(*id).limit(1);
        let result = self
            .fanout
            .query_required(&endpoints, &filter, self.timeout)
            .await
            .map_err(|e| match e {
                Error::AllEndpointsFailed { .. } => Error::NotFound(id.to_hex()),
                other => other,
            })?;

        let record = result
            .records
            .into_iter()
            .find(|r| r.id == *id)
            .ok_or_else(|| Error::NotFound(id.to_hex()))?;
        if let Err(e) = self.cache.insert(&record) {
            tracing::debug!("Not caching {}: {}", record.id.short(), e);
        }
        Ok(record)
    }

    /// The thread root of `record`, or `record` itself when it is a root.
    pub async fn fetch_root(&self, record: &Record, hints: &[Endpoint]) -> Result<Record> {
        match record.root() {
            Some(root) if root != record.id => self.fetch_record(&root, hints).await,
            _ => Ok(record.clone()),
        }
    }

    /// One permit per endpoint, acquired in a fixed order.
    async fn acquire(&self, endpoints: &[Endpoint]) -> Vec<OwnedSemaphorePermit> {
        let mut sorted: Vec<&Endpoint> = endpoints.iter().collect();
        sorted.sort();
        sorted.dedup();

        let semaphores: Vec<Arc<Semaphore>> = {
            let mut permits = self.permits.lock();
            sorted
                .into_iter()
                .map(|endpoint| {
                    permits
                        .entry(endpoint.clone())
                        .or_insert_with(|| Arc::new(Semaphore::new(1)))
                        .clone()
                })
                .collect()
        };

        let mut held = Vec::with_capacity(semaphores.len());
        for semaphore in semaphores {
            if let Ok(permit) = semaphore.acquire_owned().await {
                held.push(permit);
            }
        }
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteEventCache;
    use crate::directory::StaticDirectory;
    use crate::testing::{MockTransport, Reply, endpoint, note, participant, reply_to};

    fn loader(transport: Arc<MockTransport>, cache: Arc<SqliteEventCache>) -> ThreadLoader {
        let directory = StaticDirectory::new()
            .with_read(participant(1), vec![endpoint("inbox")])
            .with_fallback(Vec::new());
        ThreadLoader::new(
            Fanout::new(transport),
            cache,
            Arc::new(directory),
            &SyncConfig::default(),
            vec![endpoint("lookup")],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_oldest_first_and_cached() {
        let transport = MockTransport::new();
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let parent = note(1, 1, 100);
        let other = note(9, 1, 100);
        transport.reply(
            &endpoint("inbox"),
            Reply::records(vec![
                reply_to(3, 3, 300, &parent),
                reply_to(2, 2, 200, &parent),
                reply_to(4, 2, 250, &other),
            ]),
        );

        let loader = loader(transport.clone(), cache.clone());
        let replies = loader.load_replies(&parent).await.unwrap();

        let timestamps: Vec<_> = replies.iter().map(|r| r.created_at).collect();
        assert_eq!(timestamps, vec![200, 300]);
        assert_eq!(cache.len().unwrap(), 2);

        let queries = transport.queries();
        let (queried, filter) = &queries[0];
        assert_eq!(queried, &endpoint("inbox"));
        assert_eq!(filter.limit, Some(REPLY_LIMIT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_inbox_means_no_replies() {
        let transport = MockTransport::new();
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let loader = loader(transport.clone(), cache);

        let replies = loader.load_replies(&note(1, 2, 100)).await.unwrap();
        assert!(replies.is_empty());
        assert_eq!(transport.query_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_queries_share_endpoint_permits() {
        let transport = MockTransport::new();
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        transport.reply(&endpoint("inbox"), Reply::records(Vec::new()).after_ms(1000));
        let loader = loader(transport, cache);

        let note_a = note(1, 1, 100);
        let note_b = note(2, 1, 100);
        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            loader.load_replies(&note_a),
            loader.load_replies(&note_b)
        );
        a.unwrap();
        b.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_record_prefers_cache() {
        let transport = MockTransport::new();
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let record = note(5, 1, 100);
        cache.insert(&record).unwrap();

        let loader = loader(transport.clone(), cache);
        assert_eq!(loader.fetch_record(&record.id, &[]).await.unwrap(), record);
        assert_eq!(transport.query_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_record_from_network_or_not_found() {
        let transport = MockTransport::new();
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let record = note(5, 1, 100);
        transport.reply(&endpoint("hint"), Reply::records(vec![record.clone()]));
        transport.reply(&endpoint("lookup"), Reply::error("down"));

        let loader = loader(transport.clone(), cache.clone());
        let fetched = loader.fetch_record(&record.id, &[endpoint("hint")]).await.unwrap();
        assert_eq!(fetched, record);
        assert_eq!(cache.len().unwrap(), 1);

        let missing = note(6, 1, 100);
        let err = loader.fetch_record(&missing.id, &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_root_follows_root_tag() {
        let transport = MockTransport::new();
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let root = note(1, 1, 100);
        cache.insert(&root).unwrap();
        let reply = reply_to(2, 2, 200, &root);

        let loader = loader(transport, cache);
        assert_eq!(loader.fetch_root(&reply, &[]).await.unwrap(), root);
        assert_eq!(loader.fetch_root(&root, &[]).await.unwrap(), root);
    }
}
