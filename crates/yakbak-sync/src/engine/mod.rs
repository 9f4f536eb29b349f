//! Feed sync engine.
//!
//! One [`FeedSession`] runs per active [`Selection`]. A participant-set
//! session moves through these phases:
//!
//! ```text
//!   Idle ──► PreliminaryFetch ──► CatchingUp ──► Live ◄──┐
//!             (cache, then a       (per-participant    │  show_more
//!              small fan-out)       since-watermark)   └─ (paginating)
//! ```
//!
//! Relay-set selections skip the cache and the watermarks: one subscription
//! buffers stored records until every endpoint signalled end-of-stored data,
//! then keeps running as the live tail.
//!
//! Session state lives behind a mutex that is never held across an `.await`.
//! Every mutation re-checks the session's cancellation token under that
//! mutex, so a response that arrives after cancellation changes nothing.
//!
//! # Usage
//!
//! ```ignore
//! let engine = SyncEngine::new(EngineDeps { transport, cache, directory, watermarks, clock, config });
//! let session = engine.start(Selection::profile(author));
//! session.ready().await;
//! for record in session.visible_records() {
//!     println!("{}", record.id);
//! }
//! session.show_more().await?;
//! ```

mod relay_set;
mod session;
pub mod window;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use yakbak_core::{Endpoint, ParticipantId, Record};

use crate::cache::{EventCache, InsertOutcome};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::directory::EndpointDirectory;
use crate::fanout::Fanout;
use crate::selection::Selection;
use crate::transport::Transport;
use crate::watermark::WatermarkTable;
use crate::{Error, Result};

pub use window::MergeWindow;

/// Capacity of a session's update channel.
pub const UPDATE_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    PreliminaryFetch,
    CatchingUp,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatus {
    pub phase: Phase,
    /// Nothing has been shown yet and the session is still working on it.
    pub loading: bool,
    /// A backward pagination pass is running.
    pub paginating: bool,
    /// Backward pagination found nothing more.
    pub exhausted: bool,
    /// Set when the session stopped on an error.
    pub error: Option<String>,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            loading: true,
            paginating: false,
            exhausted: false,
            error: None,
        }
    }
}

/// Changes pushed to the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    /// A new selection replaced the feed; earlier records are gone.
    SelectionChanged { label: String },
    /// The visible records, replaced wholesale.
    Reset { visible: Vec<Record> },
    /// `record` became visible at `index`.
    Inserted { index: usize, record: Record },
    Status(FeedStatus),
}

/// Collaborators of the engine. Nothing is global.
pub struct EngineDeps {
    pub transport: Arc<dyn Transport>,
    pub cache: Arc<dyn EventCache>,
    pub directory: Arc<dyn EndpointDirectory>,
    pub watermarks: Arc<WatermarkTable>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

#[derive(Clone)]
pub struct SyncEngine {
    deps: Arc<EngineDeps>,
}

impl SyncEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn deps(&self) -> &Arc<EngineDeps> {
        &self.deps
    }

    /// Start a session with its own update channel.
    pub fn start(&self, selection: Selection) -> FeedSession {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        self.start_with(selection, updates)
    }

    /// Start a session publishing to `updates`.
    pub fn start_with(
        &self,
        selection: Selection,
        updates: broadcast::Sender<FeedUpdate>,
    ) -> FeedSession {
        let (status, _) = watch::channel(FeedStatus::default());
        let shared = Arc::new(Shared {
            fanout: Fanout::new(self.deps.transport.clone()),
            deps: self.deps.clone(),
            selection,
            state: Mutex::new(SessionState::default()),
            status,
            updates,
            cancel: CancellationToken::new(),
            paging: tokio::sync::Mutex::new(()),
        });

        let task = shared.clone();
        tokio::spawn(async move { task.drive().await });

        FeedSession { shared }
    }
}

/// Where one participant is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub participant: ParticipantId,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub window: MergeWindow,
    pub status: FeedStatus,
    pub routes: Vec<Route>,
    /// Participants whose history ran out during this session.
    pub exhausted: HashSet<ParticipantId>,
    pub empty_passes: usize,
    pub failed_passes: usize,
}

pub(crate) struct Shared {
    pub deps: Arc<EngineDeps>,
    pub fanout: Fanout,
    pub selection: Selection,
    state: Mutex<SessionState>,
    status: watch::Sender<FeedStatus>,
    updates: broadcast::Sender<FeedUpdate>,
    pub cancel: CancellationToken,
    /// Serializes `show_more` calls.
    paging: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn drive(self: Arc<Self>) {
        let started = Instant::now();
        tracing::info!("Starting feed session: {}", self.selection.label);
        metrics::gauge!("feed_sessions_active").increment(1.0);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.run() => result,
        };

        if let Err(e) = outcome {
            tracing::warn!("Feed session {} stopped: {}", self.selection.label, e);
            self.fail(&e);
        }

        metrics::gauge!("feed_sessions_active").decrement(1.0);
        tracing::info!(
            "Feed session {} ended after {:?}",
            self.selection.label,
            started.elapsed()
        );
    }

    async fn run(&self) -> Result<()> {
        if self.selection.is_relay_set() {
            relay_set::run(self).await
        } else {
            session::run(self).await
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `f` on the session state unless the session was cancelled.
    pub fn commit<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(f(&mut state))
    }

    pub fn publish_visible(&self, state: &SessionState) {
        let _ = self.updates.send(FeedUpdate::Reset {
            visible: state.window.visible().to_vec(),
        });
    }

    pub fn publish_inserted(&self, index: usize, record: Record) {
        let _ = self.updates.send(FeedUpdate::Inserted { index, record });
    }

    pub fn publish_status(&self, state: &SessionState) {
        self.status.send_replace(state.status.clone());
        let _ = self.updates.send(FeedUpdate::Status(state.status.clone()));
    }

    pub fn set_phase(&self, phase: Phase) {
        self.commit(|state| {
            state.status.phase = phase;
            if phase == Phase::Live {
                state.status.loading = false;
            }
            self.publish_status(state);
        });
    }

    /// Add `records` to the window, sort, and expose the initial page.
    pub fn materialize(&self, records: Vec<Record>) {
        let initial = self.deps.config.initial_visible;
        self.commit(|state| {
            let mut merged = 0;
            for record in records {
                if state.window.append(record) {
                    merged += 1;
                }
            }
            metrics::counter!("feed_records_merged_total").increment(merged);
            state.window.sort();
            state.window.raise_to(initial);
            if !state.window.is_empty() {
                state.status.loading = false;
            }
            self.publish_visible(state);
            self.publish_status(state);
        });
    }

    /// Insert into the cache. False only when the cache already held the
    /// record; a failing cache does not hide records from the feed.
    pub fn ingest(&self, record: &Record) -> bool {
        match self.deps.cache.insert(record) {
            Ok(InsertOutcome::Inserted) => {
                metrics::counter!("cache_inserts_total").increment(1);
                true
            }
            Ok(InsertOutcome::AlreadyExists) => {
                metrics::counter!("feed_records_duplicate_total").increment(1);
                false
            }
            Err(e) => {
                tracing::warn!("Failed to cache {}: {}", record.id.short(), e);
                metrics::counter!("cache_errors_total").increment(1);
                true
            }
        }
    }

    /// Ingest `records`, keeping the new ones that belong to the feed.
    pub fn ingest_all(&self, records: &[Record]) -> Vec<Record> {
        records
            .iter()
            .filter(|record| self.ingest(record) && self.selection.accepts(record))
            .cloned()
            .collect()
    }

    pub fn flush_watermarks(&self) {
        if let Err(e) = self.deps.watermarks.flush() {
            tracing::warn!("Failed to persist watermarks: {}", e);
        }
    }

    fn fail(&self, error: &Error) {
        self.commit(|state| {
            state.status.error = Some(error.to_string());
            state.status.phase = Phase::Idle;
            state.status.loading = false;
            state.status.paginating = false;
            self.publish_status(state);
        });
    }
}

/// Handle to a running session. Dropping it cancels the session.
pub struct FeedSession {
    shared: Arc<Shared>,
}

impl FeedSession {
    pub fn selection(&self) -> &Selection {
        &self.shared.selection
    }

    pub fn visible_records(&self) -> Vec<Record> {
        self.shared.state.lock().window.visible().to_vec()
    }

    /// Records held in memory, visible or not.
    pub fn held(&self) -> usize {
        self.shared.state.lock().window.len()
    }

    pub fn status(&self) -> FeedStatus {
        self.shared.state.lock().status.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.lock().status.loading
    }

    /// Whether `show_more` can reveal anything.
    pub fn is_paginable(&self) -> bool {
        let state = self.shared.state.lock();
        if state.status.paginating || self.shared.is_cancelled() {
            return false;
        }
        if state.window.has_hidden() {
            return true;
        }
        !self.shared.selection.is_relay_set()
            && state.status.phase == Phase::Live
            && !state.status.exhausted
    }

    pub fn updates(&self) -> broadcast::Receiver<FeedUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the session is live, failed, or cancelled.
    pub async fn ready(&self) {
        let mut status = self.shared.status.subscribe();
        tokio::select! {
            _ = status.wait_for(|s| s.phase == Phase::Live || s.error.is_some()) => {}
            _ = self.shared.cancel.cancelled() => {}
        }
    }

    /// Reveal the next page, paginating backwards when every held record is
    /// already visible. Returns the number of visible records.
    pub async fn show_more(&self) -> Result<usize> {
        let shared = &self.shared;
        if shared.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _paging = shared.paging.lock().await;

        if shared.selection.is_relay_set() {
            return relay_set::show_more(shared);
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => Err(Error::Cancelled),
            result = session::show_more(shared) => result,
        }
    }

    /// Stop the session. Late responses are discarded.
    pub fn cancel(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();

        let mut state = self.shared.state.lock();
        state.status.phase = Phase::Idle;
        state.status.loading = false;
        state.status.paginating = false;
        self.shared.status.send_replace(state.status.clone());
        tracing::debug!("Cancelled feed session {}", self.shared.selection.label);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Union of the routes' endpoints in first-seen order.
pub(crate) fn union_endpoints(routes: &[Route]) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    routes
        .iter()
        .flat_map(|route| route.endpoints.iter())
        .filter(|endpoint| seen.insert(*endpoint))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{endpoint, participant};

    #[test]
    fn test_union_endpoints_keeps_first_seen_order() {
        let routes = vec![
            Route {
                participant: participant(1),
                endpoints: vec![endpoint("a"), endpoint("b")],
            },
            Route {
                participant: participant(2),
                endpoints: vec![endpoint("b"), endpoint("c")],
            },
        ];
        assert_eq!(
            union_endpoints(&routes),
            vec![endpoint("a"), endpoint("b"), endpoint("c")]
        );
    }

    #[test]
    fn test_default_status_is_loading() {
        let status = FeedStatus::default();
        assert_eq!(status.phase, Phase::Idle);
        assert!(status.loading);
        assert!(status.error.is_none());
    }
}
