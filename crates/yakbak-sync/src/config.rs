//! Engine configuration.
//!
//! Every tunable lives in [`SyncConfig`] and is passed to the engine
//! explicitly. [`SyncConfig::from_env`] overlays `YAKBAK_*` variables on the
//! defaults.

use std::time::Duration;

use yakbak_core::Endpoint;

use crate::{Error, Result};

/// Relays used to look up NIP-65 relay lists when nothing else is known.
pub const DEFAULT_INDEXER_RELAYS: &[&str] = &["wss://purplepag.es", "wss://user.kindpag.es"];

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A participant whose `newest` is within this window is not re-queried.
    pub freshness_window: Duration,

    /// Maximum participants caught up concurrently.
    pub catchup_concurrency: usize,

    /// Maximum write/read endpoints used per participant.
    pub outbox_cap: usize,

    /// Deadline for the preliminary fan-out and the relay-set stored phase.
    pub preliminary_timeout: Duration,

    /// Deadline for catch-up, pagination and point queries.
    pub query_timeout: Duration,

    /// Page size of the preliminary fan-out when the cache is empty.
    pub preliminary_page_size: usize,

    /// Limit of a catch-up query for a participant with no watermark.
    pub first_page_limit: usize,

    /// Limit of one backward pagination query.
    pub pagination_limit: usize,

    /// Maximum rows read from the cache to seed a session.
    pub cache_read_limit: usize,

    /// Records visible when a session first materializes.
    pub initial_visible: usize,

    /// Records revealed by each `show_more`.
    pub page_size: usize,

    /// Subscription limit in relay-set mode.
    pub relay_set_limit: usize,

    /// Wait before re-establishing an ended live subscription.
    pub live_reconnect_delay: Duration,

    /// Debounce interval for persisting watermark changes made by the live tail.
    pub watermark_flush_interval: Duration,

    /// Consecutive passes without new records before the selection is exhausted.
    pub exhaust_after_empty_passes: usize,

    /// Consecutive passes in which every query failed before they count as empty.
    pub max_failed_passes: usize,

    /// Relays queried for NIP-65 relay lists.
    pub indexer_relays: Vec<Endpoint>,

    /// Capacity of the directory's relay-list cache.
    pub directory_cache_capacity: u64,

    /// Time to live of a cached relay list.
    pub directory_cache_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(2 * 60 * 60),
            catchup_concurrency: 15,
            outbox_cap: 4,
            preliminary_timeout: Duration::from_millis(2800),
            query_timeout: Duration::from_secs(5),
            preliminary_page_size: 20,
            first_page_limit: 100,
            pagination_limit: 50,
            cache_read_limit: 200,
            initial_visible: 20,
            page_size: 20,
            relay_set_limit: 400,
            live_reconnect_delay: Duration::from_secs(5),
            watermark_flush_interval: Duration::from_secs(10),
            exhaust_after_empty_passes: 1,
            max_failed_passes: 3,
            indexer_relays: DEFAULT_INDEXER_RELAYS
                .iter()
                .map(|url| Endpoint::new(*url))
                .collect(),
            directory_cache_capacity: 10_000,
            directory_cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (defaults in parentheses):
    /// - `YAKBAK_FRESHNESS_SECS` (7200)
    /// - `YAKBAK_CATCHUP_CONCURRENCY` (15)
    /// - `YAKBAK_OUTBOX_CAP` (4)
    /// - `YAKBAK_PRELIMINARY_TIMEOUT_MS` (2800)
    /// - `YAKBAK_QUERY_TIMEOUT_MS` (5000)
    /// - `YAKBAK_PAGE_SIZE` (20)
    /// - `YAKBAK_INITIAL_VISIBLE` (20)
    /// - `YAKBAK_RELAY_SET_LIMIT` (400)
    /// - `YAKBAK_INDEXER_RELAYS`: comma-separated relay URLs
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("YAKBAK_FRESHNESS_SECS")? {
            config.freshness_window = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("YAKBAK_CATCHUP_CONCURRENCY")? {
            config.catchup_concurrency = n;
        }
        if let Some(n) = env_parse::<usize>("YAKBAK_OUTBOX_CAP")? {
            config.outbox_cap = n;
        }
        if let Some(ms) = env_parse::<u64>("YAKBAK_PRELIMINARY_TIMEOUT_MS")? {
            config.preliminary_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("YAKBAK_QUERY_TIMEOUT_MS")? {
            config.query_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("YAKBAK_PAGE_SIZE")? {
            config.page_size = n;
        }
        if let Some(n) = env_parse::<usize>("YAKBAK_INITIAL_VISIBLE")? {
            config.initial_visible = n;
        }
        if let Some(n) = env_parse::<usize>("YAKBAK_RELAY_SET_LIMIT")? {
            config.relay_set_limit = n;
        }
        if let Ok(list) = std::env::var("YAKBAK_INDEXER_RELAYS") {
            let relays: Vec<Endpoint> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Endpoint::new)
                .collect();
            if !relays.is_empty() {
                config.indexer_relays = relays;
            }
        }

        config.validate()?;

        tracing::info!(
            freshness_secs = config.freshness_window.as_secs(),
            catchup_concurrency = config.catchup_concurrency,
            outbox_cap = config.outbox_cap,
            page_size = config.page_size,
            "sync configuration loaded"
        );

        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.catchup_concurrency == 0 {
            return Err(Error::Config("catchup_concurrency must be > 0".to_string()));
        }
        if self.outbox_cap == 0 {
            return Err(Error::Config("outbox_cap must be > 0".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be > 0".to_string()));
        }
        if self.exhaust_after_empty_passes == 0 {
            return Err(Error::Config(
                "exhaust_after_empty_passes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Freshness window in whole seconds.
    pub fn freshness_secs(&self) -> i64 {
        self.freshness_window.as_secs() as i64
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(None),
    }
}
