//! Notifications for one user.
//!
//! Reactions, reposts, zaps and voice replies that tag the user and point at
//! a voice note. Stored notifications come from the cache; new ones arrive
//! over a subscription on the user's read endpoints. The last-seen marker is
//! kept in the key/value store under `last-seen-by:<hex>`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use yakbak_core::{
    Filter, ParticipantId, Record, RecordId, Timestamp, VOICE_NOTE_KIND, VOICE_REPLY_KIND,
};

use crate::cache::{EventCache, KvStore};
use crate::clock::Clock;
use crate::directory::EndpointDirectory;
use crate::engine::EngineDeps;
use crate::transport::{StreamItem, Transport};
use crate::Result;

/// Reaction, repost, nutzap, zap receipt and voice reply.
pub const NOTIFICATION_KINDS: [u16; 5] = [7, 16, 9321, 9735, VOICE_REPLY_KIND];

/// Notifications read from the cache at startup.
pub const STORED_NOTIFICATION_LIMIT: usize = 80;

pub fn last_seen_key(user: &ParticipantId) -> String {
    format!("last-seen-by:{}", user.to_hex())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub record: Record,
    pub seen: bool,
}

struct Inner {
    items: Vec<Notification>,
    ids: HashSet<RecordId>,
    last_seen: Timestamp,
}

pub struct NotificationCenter {
    user: ParticipantId,
    cache: Arc<dyn EventCache>,
    store: Arc<dyn KvStore>,
    directory: Arc<dyn EndpointDirectory>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    cap: usize,
    reconnect_delay: Duration,
    inner: Mutex<Inner>,
    updates: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    /// Create the center for `user`, reading the persisted last-seen marker.
    pub fn new(user: ParticipantId, deps: &EngineDeps, store: Arc<dyn KvStore>) -> Result<Self> {
        let last_seen = match store.get(&last_seen_key(&user))? {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("Ignoring malformed last-seen marker {:?}", raw);
                0
            }),
            None => 0,
        };
        let (updates, _) = broadcast::channel(256);

        Ok(Self {
            user,
            cache: deps.cache.clone(),
            store,
            directory: deps.directory.clone(),
            transport: deps.transport.clone(),
            clock: deps.clock.clone(),
            cap: deps.config.outbox_cap,
            reconnect_delay: deps.config.live_reconnect_delay,
            inner: Mutex::new(Inner {
                items: Vec::new(),
                ids: HashSet::new(),
                last_seen,
            }),
            updates,
        })
    }

    fn filter(&self) -> Filter {
        Filter::new()
            .kinds(NOTIFICATION_KINDS)
            .tag('k', [VOICE_NOTE_KIND.to_string(), VOICE_REPLY_KIND.to_string()])
            .tag('p', [self.user.to_hex()])
    }

    /// Load cached notifications. Returns how many were added.
    pub fn load_stored(&self) -> Result<usize> {
        let stored = self
            .cache
            .query_range(&self.filter(), STORED_NOTIFICATION_LIMIT)?;
        let added = stored
            .into_iter()
            .filter(|record| self.is_notification(record))
            .filter(|record| self.push(record.clone()))
            .count();
        tracing::debug!("Loaded {} stored notifications", added);
        Ok(added)
    }

    /// Follow new notifications until the future is dropped.
    pub async fn run(&self) -> Result<()> {
        let mut inbox = self.directory.read_endpoints(&self.user).await?;
        inbox.truncate(self.cap);
        if inbox.is_empty() {
            tracing::info!("No read endpoints for {}, notifications are cache-only", self.user.short());
            return futures::future::pending().await;
        }

        loop {
            let since = self.inner.lock().last_seen;
            let filter = self.filter().since(since);
            tracing::debug!(
                "Notification subscription on {} endpoints since {}",
                inbox.len(),
                since
            );

            match self.transport.subscribe(&inbox, &filter).await {
                Ok(mut subscription) => {
                    while let Some(item) = subscription.next().await {
                        if let StreamItem::Record { record, .. } = item {
                            self.handle(record);
                        }
                    }
                }
                Err(e) => tracing::warn!("Notification subscription failed: {}", e),
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Process one incoming record. Returns true if it became a notification.
    pub fn handle(&self, record: Record) -> bool {
        if !has_target(&record) {
            return false;
        }
        if let Err(e) = self.cache.insert(&record) {
            tracing::debug!("Not caching {}: {}", record.id.short(), e);
        }
        self.is_notification(&record) && self.push(record)
    }

    fn is_notification(&self, record: &Record) -> bool {
        has_target(record) && record.author != self.user && NOTIFICATION_KINDS.contains(&record.kind)
    }

    fn push(&self, record: Record) -> bool {
        let notification = {
            let mut inner = self.inner.lock();
            if !inner.ids.insert(record.id) {
                return false;
            }
            let notification = Notification {
                seen: record.created_at <= inner.last_seen,
                record,
            };
            let index = inner
                .items
                .partition_point(|n| n.record.created_at >= notification.record.created_at);
            inner.items.insert(index, notification.clone());
            notification
        };
        let _ = self.updates.send(notification);
        true
    }

    /// All notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().items.clone()
    }

    pub fn unseen_count(&self) -> usize {
        self.inner.lock().items.iter().filter(|n| !n.seen).count()
    }

    pub fn updates(&self) -> broadcast::Receiver<Notification> {
        self.updates.subscribe()
    }

    /// Mark one notification read. The last-seen marker never moves back.
    pub fn mark_as_read(&self, id: &RecordId) -> Result<bool> {
        let last_seen = {
            let mut inner = self.inner.lock();
            let Some(created_at) = inner
                .items
                .iter_mut()
                .find(|n| n.record.id == *id)
                .map(|n| {
                    n.seen = true;
                    n.record.created_at
                })
            else {
                return Ok(false);
            };
            inner.last_seen = inner.last_seen.max(created_at);
            inner.last_seen
        };
        self.persist(last_seen)?;
        Ok(true)
    }

    pub fn mark_all_as_read(&self) -> Result<()> {
        let now = self.clock.now();
        let last_seen = {
            let mut inner = self.inner.lock();
            for n in inner.items.iter_mut() {
                n.seen = true;
            }
            inner.last_seen = inner.last_seen.max(now);
            inner.last_seen
        };
        self.persist(last_seen)
    }

    fn persist(&self, last_seen: Timestamp) -> Result<()> {
        self.store
            .put(&last_seen_key(&self.user), &last_seen.to_string())
    }
}

/// Records without an `e`/`E` target cannot be shown as notifications.
fn has_target(record: &Record) -> bool {
    record
        .tags
        .iter()
        .any(|t| t.len() >= 2 && (t[0] == "e" || t[0] == "E") && !t[1].is_empty())
}
