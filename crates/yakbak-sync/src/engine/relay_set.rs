//! Relay-set sessions.
//!
//! The unit of sync is an endpoint, not a participant: no watermarks, no
//! cache read before the network. One subscription with a large limit is
//! buffered until every endpoint has sent its stored records (or the
//! preliminary deadline passes), then exposed sorted; everything after that
//! is live. `show_more` only reveals records already held.

use std::collections::HashSet;

use yakbak_core::{Endpoint, Record, RecordId};

use super::{Phase, Shared};
use crate::selection::Source;
use crate::transport::{StreamItem, Subscription};
use crate::{Error, Result};

pub(super) async fn run(shared: &Shared) -> Result<()> {
    let deps = &shared.deps;
    let config = &deps.config;
    let Source::Relays(endpoints) = &shared.selection.source else {
        return Err(Error::Config(format!(
            "{} is not a relay-set selection",
            shared.selection.label
        )));
    };

    shared.set_phase(Phase::PreliminaryFetch);
    let filter = shared.selection.base.clone().limit(config.relay_set_limit);
    let mut seen: HashSet<RecordId> = HashSet::new();
    let mut materialized = false;

    loop {
        match deps.transport.subscribe(endpoints, &filter).await {
            Ok(mut subscription) => {
                if !materialized {
                    let mut stored =
                        collect_stored(shared, &mut subscription, endpoints, &mut seen).await;
                    stored.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    stored.truncate(config.relay_set_limit);
                    tracing::info!(
                        "{}: {} stored records from {} endpoints",
                        shared.selection.label,
                        stored.len(),
                        endpoints.len()
                    );
                    shared.materialize(stored);
                    shared.set_phase(Phase::Live);
                    materialized = true;
                }

                while let Some(item) = subscription.next().await {
                    match item {
                        StreamItem::Record { record, .. } => on_live_record(shared, &mut seen, record),
                        StreamItem::EndOfStored { .. } => {}
                        StreamItem::Closed { endpoint, reason } => {
                            tracing::debug!("{} closed: {}", endpoint, reason);
                        }
                    }
                }
                tracing::warn!("Subscription for {} ended", shared.selection.label);
            }
            Err(e) => {
                tracing::warn!("Subscription for {} failed: {}", shared.selection.label, e);
                if !materialized {
                    shared.materialize(Vec::new());
                    shared.set_phase(Phase::Live);
                    materialized = true;
                }
            }
        }

        metrics::counter!("live_resubscribe_total").increment(1);
        tokio::time::sleep(config.live_reconnect_delay).await;
    }
}

/// Buffer stored records until every endpoint is done or the deadline fires.
async fn collect_stored(
    shared: &Shared,
    subscription: &mut Subscription,
    endpoints: &[Endpoint],
    seen: &mut HashSet<RecordId>,
) -> Vec<Record> {
    let mut pending: HashSet<Endpoint> = endpoints.iter().cloned().collect();
    let mut buffer = Vec::new();
    let deadline = tokio::time::sleep(shared.deps.config.preliminary_timeout);
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            item = subscription.next() => match item {
                Some(StreamItem::Record { record, .. }) => {
                    if accept(shared, seen, &record) {
                        buffer.push(record);
                    }
                }
                Some(StreamItem::EndOfStored { endpoint })
                | Some(StreamItem::Closed { endpoint, .. }) => {
                    pending.remove(&endpoint);
                }
                None => break,
            },
            _ = &mut deadline => {
                tracing::debug!(
                    "{} endpoints missed the stored-records deadline for {}",
                    pending.len(),
                    shared.selection.label
                );
                break;
            }
        }
    }
    buffer
}

/// In-memory dedupe plus an opportunistic cache write.
fn accept(shared: &Shared, seen: &mut HashSet<RecordId>, record: &Record) -> bool {
    if !shared.selection.accepts(record) || !seen.insert(record.id) {
        return false;
    }
    if let Err(e) = shared.deps.cache.insert(record) {
        tracing::debug!("Not caching {}: {}", record.id.short(), e);
    }
    true
}

fn on_live_record(shared: &Shared, seen: &mut HashSet<RecordId>, record: Record) {
    metrics::counter!("live_records_total").increment(1);
    if !accept(shared, seen, &record) {
        return;
    }
    shared.commit(|state| {
        if let Some(index) = state.window.insert_sorted(record.clone()) {
            metrics::counter!("feed_records_merged_total").increment(1);
            if index < state.window.threshold() {
                shared.publish_inserted(index, record);
            }
        }
    });
}

pub(super) fn show_more(shared: &Shared) -> Result<usize> {
    let page = shared.deps.config.page_size;
    shared
        .commit(|state| {
            let visible = state.window.advance(page);
            shared.publish_visible(state);
            visible
        })
        .ok_or(Error::Cancelled)
}
