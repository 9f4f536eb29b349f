//! Participant-set sessions: cache seed, catch-up, live tail and backward
//! pagination.

use std::collections::HashSet;
use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use yakbak_core::{ParticipantId, Record, Timestamp};

use super::{Phase, Route, Shared, union_endpoints};
use crate::fanout::FanoutResult;
use crate::transport::StreamItem;
use crate::{Error, Result};

pub(super) async fn run(shared: &Shared) -> Result<()> {
    let deps = &shared.deps;
    shared.set_phase(Phase::PreliminaryFetch);

    let cached: Vec<Record> = deps
        .cache
        .query_range(&shared.selection.selection_filter(), deps.config.cache_read_limit)?
        .into_iter()
        .filter(|record| shared.selection.accepts(record))
        .collect();
    let had_cache = !cached.is_empty();
    if had_cache {
        tracing::debug!(
            "Seeded {} with {} cached records",
            shared.selection.label,
            cached.len()
        );
        shared.materialize(cached);
    }

    let routes = resolve_routes(shared).await?;
    shared.commit(|state| state.routes = routes.clone());

    if !had_cache {
        preliminary_fetch(shared, &routes).await;
    }

    shared.set_phase(Phase::CatchingUp);
    catch_up(shared, &routes).await;
    shared.commit(|state| {
        state.window.sort();
        state.window.raise_to(deps.config.initial_visible);
        shared.publish_visible(state);
    });

    live(shared, &routes).await
}

/// Resolve every participant's write endpoints. Fails only when nobody
/// could be resolved.
async fn resolve_routes(shared: &Shared) -> Result<Vec<Route>> {
    let deps = &shared.deps;
    let participants = shared.selection.participant_list();
    if participants.is_empty() {
        return Ok(Vec::new());
    }

    let resolved: Vec<_> = futures::stream::iter(participants.iter().copied())
        .map(|participant| async move {
            let endpoints = deps.directory.write_endpoints(&participant).await;
            (participant, endpoints)
        })
        .buffered(deps.config.catchup_concurrency)
        .collect()
        .await;

    let mut routes = Vec::with_capacity(resolved.len());
    let mut failures = 0;
    for (participant, outcome) in resolved {
        match outcome {
            Ok(mut endpoints) => {
                endpoints.truncate(deps.config.outbox_cap);
                routes.push(Route {
                    participant,
                    endpoints,
                });
            }
            Err(e) => {
                failures += 1;
                tracing::debug!("No endpoints for {}: {}", participant.short(), e);
            }
        }
    }

    if routes.is_empty() {
        return Err(Error::Directory(format!(
            "could not resolve endpoints for any of {} participants",
            failures
        )));
    }
    Ok(routes)
}

/// One small fan-out so an empty cache still shows something quickly.
async fn preliminary_fetch(shared: &Shared, routes: &[Route]) {
    let config = &shared.deps.config;
    let endpoints = union_endpoints(routes);
    if endpoints.is_empty() {
        return;
    }

    let participants: Vec<ParticipantId> = routes.iter().map(|r| r.participant).collect();
    let filter = shared
        .selection
        .filter_for(&participants)
        .limit(config.preliminary_page_size);
    let result = shared
        .fanout
        .query(&endpoints, &filter, config.preliminary_timeout)
        .await;

    if shared.is_cancelled() {
        return;
    }
    let fresh = shared.ingest_all(&result.records);
    tracing::debug!(
        "Preliminary fetch: {} records from {}/{} endpoints",
        fresh.len(),
        result.succeeded,
        endpoints.len()
    );
    shared.materialize(fresh);
}

async fn catch_up(shared: &Shared, routes: &[Route]) {
    let started = Instant::now();
    let semaphore = Semaphore::new(shared.deps.config.catchup_concurrency);

    let mut rounds: FuturesUnordered<_> = routes
        .iter()
        .map(|route| {
            let semaphore = &semaphore;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                catch_up_participant(shared, route).await;
            }
        })
        .collect();
    while rounds.next().await.is_some() {}

    shared.flush_watermarks();
    metrics::histogram!("catchup_duration_seconds").record(started.elapsed().as_secs_f64());
    tracing::info!(
        "Caught up {} participants for {} in {:?}",
        routes.len(),
        shared.selection.label,
        started.elapsed()
    );
}

async fn catch_up_participant(shared: &Shared, route: &Route) {
    let deps = &shared.deps;
    let participant = route.participant;
    let now = deps.clock.now();
    let watermark = deps.watermarks.get(&participant);

    if let Some(wm) = watermark
        && wm.is_fresh(now, deps.config.freshness_secs())
    {
        tracing::debug!(
            "Skipping {}: synced {}s ago",
            participant.short(),
            now - wm.newest
        );
        metrics::counter!("catchup_participants_skipped_total").increment(1);
        return;
    }
    if route.endpoints.is_empty() {
        tracing::debug!("Skipping {}: no write endpoints", participant.short());
        return;
    }

    let base = shared.selection.filter_for(&[participant]);
    let filter = match watermark {
        Some(wm) => base.since(wm.newest),
        None => base.limit(deps.config.first_page_limit),
    };
    let result = shared
        .fanout
        .query(&route.endpoints, &filter, deps.config.query_timeout)
        .await;
    metrics::counter!("catchup_participants_total").increment(1);

    if shared.is_cancelled() {
        return;
    }
    let fresh = shared.ingest_all(&result.records);

    shared.commit(|state| {
        // New records are placed in order and always exposed.
        let mut merged = 0;
        for record in fresh {
            if let Some(index) = state.window.insert_sorted(record) {
                state.window.raise_to(index + 1);
                merged += 1;
            }
        }
        if merged > 0 {
            metrics::counter!("feed_records_merged_total").increment(merged as u64);
            shared.publish_visible(state);
        }

        if result.all_failed() {
            tracing::debug!(
                "Catch-up for {} got no answers, watermark unchanged",
                participant.short()
            );
            return;
        }
        match watermark {
            Some(_) => {
                deps.watermarks.extend_newest(&participant, now);
            }
            None => {
                let oldest = result
                    .oldest_created_at()
                    .map_or(now - 1, |seen| seen.min(now - 1));
                deps.watermarks.initialize_if_absent(&participant, oldest, now);
            }
        }
    });
}

async fn live(shared: &Shared, routes: &[Route]) -> Result<()> {
    let deps = &shared.deps;
    let endpoints = union_endpoints(routes);
    shared.set_phase(Phase::Live);

    if endpoints.is_empty() {
        tracing::info!("Nothing to tail for {}", shared.selection.label);
        shared.cancel.cancelled().await;
        return Ok(());
    }

    let authors: Vec<ParticipantId> = routes.iter().map(|r| r.participant).collect();
    let tracked: HashSet<ParticipantId> = authors.iter().copied().collect();
    let flush_every = deps.config.watermark_flush_interval;

    loop {
        let since = deps.clock.now() - deps.config.freshness_secs();
        let filter = shared.selection.filter_for(&authors).since(since);

        match deps.transport.subscribe(&endpoints, &filter).await {
            Ok(mut subscription) => {
                tracing::debug!(
                    "Live tail for {} on {} endpoints",
                    shared.selection.label,
                    endpoints.len()
                );
                let mut flush =
                    tokio::time::interval_at(tokio::time::Instant::now() + flush_every, flush_every);
                loop {
                    tokio::select! {
                        item = subscription.next() => match item {
                            Some(StreamItem::Record { record, .. }) => {
                                on_live_record(shared, &tracked, record);
                            }
                            Some(StreamItem::EndOfStored { endpoint }) => {
                                tracing::trace!("{} caught up", endpoint);
                            }
                            Some(StreamItem::Closed { endpoint, reason }) => {
                                tracing::debug!("{} closed the live tail: {}", endpoint, reason);
                            }
                            None => break,
                        },
                        _ = flush.tick() => {
                            if deps.watermarks.is_dirty() {
                                shared.flush_watermarks();
                            }
                        }
                    }
                }
                tracing::warn!("Live tail for {} ended", shared.selection.label);
            }
            Err(e) => tracing::warn!("Live tail for {} failed: {}", shared.selection.label, e),
        }

        shared.flush_watermarks();
        metrics::counter!("live_resubscribe_total").increment(1);
        tokio::time::sleep(deps.config.live_reconnect_delay).await;
    }
}

fn on_live_record(shared: &Shared, tracked: &HashSet<ParticipantId>, record: Record) {
    metrics::counter!("live_records_total").increment(1);
    if shared.is_cancelled() || !shared.ingest(&record) {
        return;
    }
    if !shared.selection.accepts(&record) {
        return;
    }

    let deps = &shared.deps;
    shared.commit(|state| {
        let author = record.author;
        if let Some(index) = state.window.insert_sorted(record.clone()) {
            metrics::counter!("feed_records_merged_total").increment(1);
            if index < state.window.threshold() {
                shared.publish_inserted(index, record);
            }
        }
        if tracked.contains(&author) {
            deps.watermarks.extend_newest(&author, deps.clock.now());
        }
    });
}

/// Everything a pagination pass learned before it touches session state.
struct Pass {
    answers: Vec<(ParticipantId, Option<Timestamp>, FanoutResult)>,
    records: Vec<Record>,
}

enum Step {
    Done(usize),
    Paginate {
        boundary: Option<Timestamp>,
        routes: Vec<Route>,
        exhausted: HashSet<ParticipantId>,
    },
}

pub(super) async fn show_more(shared: &Shared) -> Result<usize> {
    let page = shared.deps.config.page_size;
    let step = shared
        .commit(|state| {
            if state.window.has_hidden() {
                let visible = state.window.advance(page);
                shared.publish_visible(state);
                return Step::Done(visible);
            }
            if state.status.exhausted || state.status.phase != Phase::Live {
                return Step::Done(state.window.threshold());
            }
            state.status.paginating = true;
            shared.publish_status(state);
            Step::Paginate {
                boundary: state.window.oldest_created_at(),
                routes: state.routes.clone(),
                exhausted: state.exhausted.clone(),
            }
        })
        .ok_or(Error::Cancelled)?;

    let (boundary, routes, exhausted) = match step {
        Step::Done(visible) => return Ok(visible),
        Step::Paginate {
            boundary,
            routes,
            exhausted,
        } => (boundary, routes, exhausted),
    };

    metrics::counter!("feed_pagination_passes_total").increment(1);
    let pass = paginate(shared, boundary, &routes, &exhausted).await;

    let visible = shared
        .commit(|state| {
            state.status.paginating = false;
            match pass {
                Ok(pass) => Ok(apply_pass(shared, state, pass)),
                Err(e) => {
                    shared.publish_status(state);
                    Err(e)
                }
            }
        })
        .ok_or(Error::Cancelled)??;

    shared.flush_watermarks();
    Ok(visible)
}

/// Query every eligible participant for history older than their `oldest`,
/// then read the cache below `boundary`.
async fn paginate(
    shared: &Shared,
    boundary: Option<Timestamp>,
    routes: &[Route],
    exhausted: &HashSet<ParticipantId>,
) -> Result<Pass> {
    let deps = &shared.deps;
    let config = &deps.config;
    let semaphore = Semaphore::new(config.catchup_concurrency);

    // A participant without a watermark is queried below the boundary.
    let eligible: Vec<(&Route, Option<Timestamp>)> = routes
        .iter()
        .filter(|route| !exhausted.contains(&route.participant) && !route.endpoints.is_empty())
        .filter_map(|route| {
            let until = deps
                .watermarks
                .get(&route.participant)
                .map(|wm| wm.oldest)
                .or(boundary);
            let eligible = match (until, boundary) {
                (Some(until), Some(boundary)) => until >= boundary,
                _ => true,
            };
            eligible.then_some((route, until))
        })
        .collect();

    tracing::debug!(
        "Paginating {} below {:?}: {} eligible participants",
        shared.selection.label,
        boundary,
        eligible.len()
    );

    let mut queries: FuturesUnordered<_> = eligible
        .into_iter()
        .map(|(route, until)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                let mut filter = shared
                    .selection
                    .filter_for(&[route.participant])
                    .limit(config.pagination_limit);
                if let Some(until) = until {
                    filter = filter.until(until);
                }
                let result = shared
                    .fanout
                    .query(&route.endpoints, &filter, config.query_timeout)
                    .await;
                (route.participant, until, result)
            }
        })
        .collect();

    let mut answers = Vec::new();
    while let Some(answer) = queries.next().await {
        answers.push(answer);
    }

    if shared.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut records = Vec::new();
    for (_, _, result) in &answers {
        records.extend(shared.ingest_all(&result.records));
    }

    let mut below = shared.selection.selection_filter();
    if let Some(boundary) = boundary {
        below = below.until(boundary);
    }
    records.extend(
        deps.cache
            .query_range(&below, config.cache_read_limit)?
            .into_iter()
            .filter(|record| shared.selection.accepts(record)),
    );

    Ok(Pass { answers, records })
}

fn apply_pass(shared: &Shared, state: &mut super::SessionState, pass: Pass) -> usize {
    let deps = &shared.deps;
    let config = &deps.config;

    let attempted = pass.answers.len();
    let mut answered = 0;
    for (participant, until, result) in &pass.answers {
        if result.all_failed() {
            continue;
        }
        answered += 1;
        let older = result
            .oldest_created_at()
            .filter(|oldest| until.is_none_or(|until| *oldest < until));
        match older {
            Some(oldest) => {
                deps.watermarks.extend_oldest(participant, oldest);
            }
            None => {
                tracing::debug!("History of {} exhausted", participant.short());
                state.exhausted.insert(*participant);
            }
        }
    }

    let mut added = 0;
    for record in pass.records {
        if state.window.append(record) {
            added += 1;
        }
    }
    state.window.sort();
    metrics::counter!("feed_records_merged_total").increment(added as u64);

    if added > 0 {
        state.empty_passes = 0;
        state.failed_passes = 0;
    } else if attempted > 0 && answered == 0 {
        state.failed_passes += 1;
        if state.failed_passes >= config.max_failed_passes {
            state.empty_passes += 1;
        }
    } else {
        state.empty_passes += 1;
    }

    if state.empty_passes >= config.exhaust_after_empty_passes {
        tracing::info!("Pagination exhausted for {}", shared.selection.label);
        state.status.exhausted = true;
    }

    let visible = state.window.advance(config.page_size);
    shared.publish_visible(state);
    shared.publish_status(state);
    tracing::debug!(
        "Pagination pass merged {} records ({} answered of {})",
        added,
        answered,
        attempted
    );
    visible
}
