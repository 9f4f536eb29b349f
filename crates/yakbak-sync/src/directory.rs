//! Participant to endpoint resolution.
//!
//! Each participant publishes where they write ("outbox") and where they
//! expect to be read ("inbox") as a NIP-65 relay list (kind:10002). The
//! [`OutboxDirectory`] fetches those lists from indexer relays and caches
//! them; [`StaticDirectory`] is a fixed map for tests and offline use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use moka::future::Cache;
use yakbak_core::{Endpoint, Filter, ParticipantId, RELAY_LIST_KIND, Record};

use crate::config::SyncConfig;
use crate::fanout::Fanout;
use crate::relay_url::normalize_list;
use crate::{Error, Result};

/// Resolves participants to prioritized endpoints.
pub trait EndpointDirectory: Send + Sync {
    /// Where the participant publishes.
    fn write_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>>;

    /// Where the participant reads mentions and replies.
    fn read_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>>;
}

/// Endpoints parsed from a relay list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayList {
    pub write: Vec<Endpoint>,
    pub read: Vec<Endpoint>,
}

impl RelayList {
    /// Parse `r` tags: no marker means both directions.
    pub fn from_record(record: &Record, cap: usize) -> Self {
        let mut write = Vec::new();
        let mut read = Vec::new();

        for tag in &record.tags {
            if tag.len() < 2 || tag[0] != "r" {
                continue;
            }
            let url = tag[1].as_str();
            match tag.get(2).map(String::as_str) {
                Some("write") => write.push(url),
                Some("read") => read.push(url),
                _ => {
                    write.push(url);
                    read.push(url);
                }
            }
        }

        Self {
            write: normalize_list(write, cap),
            read: normalize_list(read, cap),
        }
    }
}

/// A fixed participant to endpoint map.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    write: HashMap<ParticipantId, Vec<Endpoint>>,
    read: HashMap<ParticipantId, Vec<Endpoint>>,
    fallback: Vec<Endpoint>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write(mut self, participant: ParticipantId, endpoints: Vec<Endpoint>) -> Self {
        self.write.insert(participant, endpoints);
        self
    }

    pub fn with_read(mut self, participant: ParticipantId, endpoints: Vec<Endpoint>) -> Self {
        self.read.insert(participant, endpoints);
        self
    }

    /// Endpoints returned for participants not in the map.
    pub fn with_fallback(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.fallback = endpoints;
        self
    }
}

impl EndpointDirectory for StaticDirectory {
    fn write_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        let endpoints = self
            .write
            .get(participant)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        futures::future::ready(Ok(endpoints)).boxed()
    }

    fn read_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        let endpoints = self
            .read
            .get(participant)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        futures::future::ready(Ok(endpoints)).boxed()
    }
}

/// NIP-65 backed directory.
///
/// Relay lists are fetched through the fan-out from the configured indexer
/// relays, newest list wins, and the parsed result is kept in a TTL cache.
/// Participants without a list fall back to `fallback` endpoints.
pub struct OutboxDirectory {
    fanout: Fanout,
    indexers: Vec<Endpoint>,
    fallback: Vec<Endpoint>,
    timeout: Duration,
    cap: usize,
    cache: Cache<ParticipantId, Arc<RelayList>>,
}

impl OutboxDirectory {
    pub fn new(fanout: Fanout, config: &SyncConfig, fallback: Vec<Endpoint>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.directory_cache_capacity)
            .time_to_live(config.directory_cache_ttl)
            .build();

        Self {
            fanout,
            indexers: config.indexer_relays.clone(),
            fallback,
            timeout: config.query_timeout,
            cap: config.outbox_cap,
            cache,
        }
    }

    /// Relay list for `participant`, from cache or the indexers.
    pub async fn relay_list(&self, participant: &ParticipantId) -> Result<Arc<RelayList>> {
        self.cache
            .try_get_with(*participant, self.fetch_relay_list(*participant))
            .await
            .map_err(|e| Error::Directory(e.to_string()))
    }

    async fn fetch_relay_list(&self, participant: ParticipantId) -> Result<Arc<RelayList>> {
        let filter = Filter::new().author(participant).kind(RELAY_LIST_KIND);
        let result = self
            .fanout
            .query_required(&self.indexers, &filter, self.timeout)
            .await?;

        let newest = result
            .records
            .iter()
            .filter(|r| r.author == participant && r.kind == RELAY_LIST_KIND)
            .max_by_key(|r| r.created_at);

        let list = match newest {
            Some(record) => RelayList::from_record(record, self.cap),
            None => {
                tracing::debug!("No relay list for {}", participant.short());
                RelayList::default()
            }
        };
        Ok(Arc::new(list))
    }

    fn or_fallback(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        if endpoints.is_empty() {
            self.fallback.clone()
        } else {
            endpoints.to_vec()
        }
    }
}

impl EndpointDirectory for OutboxDirectory {
    fn write_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        async move {
            let list = self.relay_list(participant).await?;
            Ok(self.or_fallback(&list.write))
        }
        .boxed()
    }

    fn read_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        async move {
            let list = self.relay_list(participant).await?;
            Ok(self.or_fallback(&list.read))
        }
        .boxed()
    }
}
