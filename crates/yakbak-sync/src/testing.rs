//! Test doubles: an in-memory relay network, failing collaborators and record
//! builders.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use yakbak_core::{
    Endpoint, Filter, ParticipantId, Record, RecordId, Timestamp, VOICE_NOTE_KIND,
    VOICE_REPLY_KIND,
};

use crate::cache::{EventCache, InsertOutcome, KvStore};
use crate::directory::EndpointDirectory;
use crate::transport::{Closer, StreamItem, Subscription, Transport};
use crate::{Error, Result};

pub fn endpoint(name: &str) -> Endpoint {
    Endpoint::new(format!("wss://{name}.example"))
}

pub fn participant(n: u8) -> ParticipantId {
    ParticipantId::from_bytes([n; 32])
}

/// A record whose id is derived from `id`.
pub fn record(id: u32, author: u8, created_at: Timestamp, kind: u16) -> Record {
    let mut bytes = [0xEE; 32];
    bytes[..4].copy_from_slice(&id.to_be_bytes());
    Record {
        id: RecordId::from_bytes(bytes),
        author: participant(author),
        created_at,
        kind,
        tags: Vec::new(),
        content: format!("record {id}"),
    }
}

/// A root voice note.
pub fn note(id: u32, author: u8, created_at: Timestamp) -> Record {
    record(id, author, created_at, VOICE_NOTE_KIND)
}

/// A voice reply to `parent`.
pub fn reply_to(id: u32, author: u8, created_at: Timestamp, parent: &Record) -> Record {
    let mut r = record(id, author, created_at, VOICE_REPLY_KIND);
    r.tags = vec![
        vec![
            "e".to_string(),
            parent.id.to_hex(),
            String::new(),
            "root".to_string(),
        ],
        vec!["p".to_string(), parent.author.to_hex()],
    ];
    r
}

#[derive(Debug, Clone)]
enum Answer {
    Stored(Vec<Record>),
    /// Returned verbatim, ignoring the filter.
    Raw(Vec<Record>),
    Error(String),
    Hang,
}

/// How a mock endpoint answers.
#[derive(Debug, Clone)]
pub struct Reply {
    answer: Answer,
    delay: Duration,
}

impl Reply {
    /// Serve `records` as the endpoint's stored data.
    pub fn records(records: Vec<Record>) -> Self {
        Self {
            answer: Answer::Stored(records),
            delay: Duration::ZERO,
        }
    }

    /// Answer every query with exactly `records`, like a relay that ignores
    /// `since`/`until`.
    pub fn raw(records: Vec<Record>) -> Self {
        Self {
            answer: Answer::Raw(records),
            delay: Duration::ZERO,
        }
    }

    pub fn error(reason: &str) -> Self {
        Self {
            answer: Answer::Error(reason.to_string()),
            delay: Duration::ZERO,
        }
    }

    /// Never answer.
    pub fn hang() -> Self {
        Self {
            answer: Answer::Hang,
            delay: Duration::ZERO,
        }
    }

    pub fn after_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

/// Stored records matching `filter`, newest first, honoring its limit.
fn select(records: &[Record], filter: &Filter) -> Vec<Record> {
    let mut matched: Vec<Record> = records
        .iter()
        .filter(|r| filter.matches(r))
        .cloned()
        .collect();
    matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = filter.limit {
        matched.truncate(limit);
    }
    matched
}

struct LiveSender {
    endpoints: Vec<Endpoint>,
    filter: Filter,
    tx: mpsc::Sender<StreamItem>,
    closer: Closer,
}

/// In-memory relay network. Unknown endpoints answer with nothing.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<Endpoint, Reply>>,
    queries: Mutex<Vec<(Endpoint, Filter)>>,
    live: Mutex<Vec<LiveSender>>,
    subscribe_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a query as in flight until its future completes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, endpoint: &Endpoint, reply: Reply) {
        self.replies.lock().insert(endpoint.clone(), reply);
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    /// Every `(endpoint, filter)` queried so far.
    pub fn queries(&self) -> Vec<(Endpoint, Filter)> {
        self.queries.lock().clone()
    }

    /// Queries started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most queries ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Subscriptions that are still open.
    pub fn open_subscriptions(&self) -> usize {
        self.live
            .lock()
            .iter()
            .filter(|s| !s.closer.is_closed())
            .count()
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Deliver `record` from `endpoint` to every open subscription that
    /// covers it. Returns how many subscriptions received it.
    pub fn push_live(&self, endpoint: &Endpoint, record: Record) -> usize {
        let live = self.live.lock();
        let mut delivered = 0;
        for sub in live.iter() {
            if sub.closer.is_closed()
                || !sub.endpoints.contains(endpoint)
                || !sub.filter.matches(&record)
            {
                continue;
            }
            let item = StreamItem::Record {
                endpoint: endpoint.clone(),
                record: record.clone(),
            };
            if sub.tx.try_send(item).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// End every open subscription stream.
    pub fn end_subscriptions(&self) {
        self.live.lock().clear();
    }

    fn answer_for(&self, endpoint: &Endpoint) -> Reply {
        self.replies
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| Reply::records(Vec::new()))
    }
}

impl Transport for MockTransport {
    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        self.queries.lock().push((endpoint.clone(), filter.clone()));
        let reply = self.answer_for(endpoint);

        async move {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            let _running = InFlight(&self.in_flight);

            tokio::time::sleep(reply.delay).await;
            match reply.answer {
                Answer::Stored(records) => Ok(select(&records, filter)),
                Answer::Raw(records) => Ok(records),
                Answer::Error(reason) => Err(Error::EndpointUnavailable {
                    endpoint: endpoint.to_string(),
                    reason,
                }),
                Answer::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }

    fn subscribe<'a>(
        &'a self,
        endpoints: &'a [Endpoint],
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Subscription>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return futures::future::ready(Err(Error::EndpointUnavailable {
                endpoint: "all".to_string(),
                reason: "subscribe refused".to_string(),
            }))
            .boxed();
        }

        let (tx, rx) = mpsc::channel(4096);
        let closer = Closer::new();

        for endpoint in endpoints {
            let reply = self.answer_for(endpoint);
            let tx = tx.clone();
            let endpoint = endpoint.clone();
            let filter = filter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(reply.delay).await;
                let items = match reply.answer {
                    Answer::Stored(records) | Answer::Raw(records) => {
                        let mut items: Vec<StreamItem> = select(&records, &filter)
                            .into_iter()
                            .map(|record| StreamItem::Record {
                                endpoint: endpoint.clone(),
                                record,
                            })
                            .collect();
                        items.push(StreamItem::EndOfStored { endpoint });
                        items
                    }
                    Answer::Error(reason) => vec![StreamItem::Closed { endpoint, reason }],
                    Answer::Hang => Vec::new(),
                };
                for item in items {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.live.lock().push(LiveSender {
            endpoints: endpoints.to_vec(),
            filter: filter.clone(),
            tx,
            closer: closer.clone(),
        });

        futures::future::ready(Ok(Subscription::new(rx, closer))).boxed()
    }
}

/// A cache whose every operation fails.
pub struct FailingCache;

impl EventCache for FailingCache {
    fn insert(&self, _record: &Record) -> Result<InsertOutcome> {
        Err(Error::Database("disk full".to_string()))
    }

    fn query_range(&self, _filter: &Filter, _limit: usize) -> Result<Vec<Record>> {
        Err(Error::Database("disk full".to_string()))
    }

    fn get_by_ids(&self, _ids: &[RecordId]) -> Result<Vec<Record>> {
        Err(Error::Database("disk full".to_string()))
    }
}

impl KvStore for FailingCache {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Database("disk full".to_string()))
    }

    fn put(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::Database("disk full".to_string()))
    }
}

/// A directory that cannot resolve anyone.
pub struct FailingDirectory;

impl EndpointDirectory for FailingDirectory {
    fn write_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        futures::future::ready(Err(Error::Directory(format!(
            "no relay list for {}",
            participant.short()
        ))))
        .boxed()
    }

    fn read_endpoints<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        self.write_endpoints(participant)
    }
}
