//! Feed view model.
//!
//! [`FeedView`] is what a UI holds: the current selection's session, a
//! stable update channel that survives selection changes, and the
//! show-more cursor.

use tokio::sync::broadcast;
use yakbak_core::Record;

use crate::Result;
use crate::engine::{FeedSession, FeedStatus, FeedUpdate, SyncEngine, UPDATE_CHANNEL_SIZE};
use crate::selection::Selection;

pub struct FeedView {
    engine: SyncEngine,
    session: FeedSession,
    updates: broadcast::Sender<FeedUpdate>,
}

impl FeedView {
    pub fn new(engine: SyncEngine, selection: Selection) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        let session = engine.start_with(selection, updates.clone());
        Self {
            engine,
            session,
            updates,
        }
    }

    /// Cancel the running session and start one for `selection`.
    /// Watermarks carry over; the merge window does not.
    pub fn change_selection(&mut self, selection: Selection) {
        self.session.cancel();
        tracing::info!(
            "Feed selection: {} -> {}",
            self.session.selection().label,
            selection.label
        );
        let _ = self.updates.send(FeedUpdate::SelectionChanged {
            label: selection.label.clone(),
        });
        self.session = self.engine.start_with(selection, self.updates.clone());
    }

    pub fn selection(&self) -> &Selection {
        self.session.selection()
    }

    pub fn current_visible_records(&self) -> Vec<Record> {
        self.session.visible_records()
    }

    pub async fn show_more(&self) -> Result<usize> {
        self.session.show_more().await
    }

    pub fn is_loading(&self) -> bool {
        self.session.is_loading()
    }

    pub fn is_paginable(&self) -> bool {
        self.session.is_paginable()
    }

    pub fn status(&self) -> FeedStatus {
        self.session.status()
    }

    /// Updates from every session this view runs.
    pub fn updates(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates.subscribe()
    }

    /// Wait until the current session is live (or stopped).
    pub async fn ready(&self) {
        self.session.ready().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::SqliteEventCache;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::directory::StaticDirectory;
    use crate::engine::{EngineDeps, Phase};
    use crate::testing::{MockTransport, Reply, endpoint, note, participant};
    use crate::watermark::WatermarkTable;

    fn engine(transport: Arc<MockTransport>) -> (SyncEngine, Arc<WatermarkTable>) {
        let cache = Arc::new(SqliteEventCache::open_in_memory().unwrap());
        let watermarks = Arc::new(WatermarkTable::load(cache.clone()).unwrap());
        let engine = SyncEngine::new(EngineDeps {
            transport,
            cache,
            directory: Arc::new(
                StaticDirectory::new()
                    .with_write(participant(1), vec![endpoint("slow")])
                    .with_write(participant(2), vec![endpoint("fast")]),
            ),
            watermarks: watermarks.clone(),
            clock: Arc::new(ManualClock::new(10_000)),
            config: SyncConfig::default(),
        });
        (engine, watermarks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_selection_drops_stale_session() {
        let transport = MockTransport::new();
        transport.reply(
            &endpoint("slow"),
            Reply::records(vec![note(1, 1, 9000)]).after_ms(2000),
        );
        transport.reply(&endpoint("fast"), Reply::records(vec![note(2, 2, 8000)]));
        let (engine, watermarks) = engine(transport);

        let mut view = FeedView::new(engine, Selection::profile(participant(1)));
        let mut updates = view.updates();
        assert!(view.is_loading());

        tokio::time::sleep(Duration::from_millis(100)).await;
        view.change_selection(Selection::profile(participant(2)));
        view.ready().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let visible = view.current_visible_records();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].author, participant(2));
        assert_eq!(watermarks.get(&participant(1)), None);
        assert!(watermarks.get(&participant(2)).is_some());
        assert_eq!(view.status().phase, Phase::Live);
        assert_eq!(view.selection().label, participant(2).short());

        let mut saw_change = false;
        while let Ok(update) = updates.try_recv() {
            match update {
                FeedUpdate::SelectionChanged { .. } => saw_change = true,
                FeedUpdate::Inserted { record, .. } => {
                    assert_eq!(record.author, participant(2))
                }
                FeedUpdate::Reset { visible } => {
                    assert!(visible.iter().all(|r| r.author == participant(2)))
                }
                FeedUpdate::Status(_) => {}
            }
        }
        assert!(saw_change);
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_more_through_view() {
        let transport = MockTransport::new();
        let notes: Vec<_> = (0..30).map(|i| note(i, 2, 5000 + i as i64)).collect();
        transport.reply(&endpoint("fast"), Reply::records(notes));
        let (engine, _) = engine(transport);

        let view = FeedView::new(engine, Selection::profile(participant(2)));
        view.ready().await;

        assert_eq!(view.current_visible_records().len(), 30);
        assert!(view.is_paginable());
        assert_eq!(view.show_more().await.unwrap(), 30);
        assert!(!view.is_paginable());
    }
}
