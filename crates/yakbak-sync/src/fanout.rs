//! Multi-endpoint query fan-out.
//!
//! The same filter goes to every endpoint at once. Endpoints answer, fail, or
//! time out independently; the caller gets the union of whatever answered
//! before the deadline. Partial failure is the normal case, not an error.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use yakbak_core::{Endpoint, Filter, Record, RecordId, Timestamp};

use crate::transport::Transport;
use crate::{Error, Result};

/// Union of a fan-out.
#[derive(Debug, Default, Clone)]
pub struct FanoutResult {
    /// Distinct records, first arrival wins.
    pub records: Vec<Record>,
    /// Which endpoints returned each record.
    pub seen_on: HashMap<RecordId, BTreeSet<Endpoint>>,
    /// Endpoints that answered (possibly with nothing).
    pub succeeded: usize,
    /// Endpoints that failed or missed the deadline.
    pub failed: usize,
}

impl FanoutResult {
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0
    }

    pub fn newest_created_at(&self) -> Option<Timestamp> {
        self.records.iter().map(|r| r.created_at).max()
    }

    pub fn oldest_created_at(&self) -> Option<Timestamp> {
        self.records.iter().map(|r| r.created_at).min()
    }
}

#[derive(Clone)]
pub struct Fanout {
    transport: Arc<dyn Transport>,
}

impl Fanout {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Query every endpoint and union what arrives within `timeout`.
    pub async fn query(
        &self,
        endpoints: &[Endpoint],
        filter: &Filter,
        timeout: Duration,
    ) -> FanoutResult {
        let started = Instant::now();
        metrics::counter!("fanout_queries_total").increment(1);
        let mut unique: Vec<&Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(&endpoint) {
                unique.push(endpoint);
            }
        }

        let mut pending: FuturesUnordered<_> = unique
            .into_iter()
            .map(|endpoint| async move {
                let outcome =
                    tokio::time::timeout(timeout, self.transport.query(endpoint, filter)).await;
                (endpoint, outcome)
            })
            .collect();

        let mut result = FanoutResult::default();
        let mut ids: HashSet<RecordId> = HashSet::new();

        while let Some((endpoint, outcome)) = pending.next().await {
            let (label, reason) = match outcome {
                Ok(Ok(records)) => {
                    result.succeeded += 1;
                    for record in records {
                        result
                            .seen_on
                            .entry(record.id)
                            .or_default()
                            .insert(endpoint.clone());
                        if ids.insert(record.id) {
                            result.records.push(record);
                        }
                    }
                    continue;
                }
                Ok(Err(e)) => ("error", e.to_string()),
                Err(_) => ("timeout", format!("no answer within {:?}", timeout)),
            };

            result.failed += 1;
            let error = Error::EndpointUnavailable {
                endpoint: endpoint.to_string(),
                reason,
            };
            tracing::debug!("{}", error);
            metrics::counter!("fanout_endpoint_failures_total", "reason" => label).increment(1);
        }

        metrics::histogram!("fanout_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    /// Like [`Fanout::query`] but fails when no endpoint answered.
    pub async fn query_required(
        &self,
        endpoints: &[Endpoint],
        filter: &Filter,
        timeout: Duration,
    ) -> Result<FanoutResult> {
        let result = self.query(endpoints, filter, timeout).await;
        if result.all_failed() {
            return Err(Error::AllEndpointsFailed {
                attempted: result.failed,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, Reply, endpoint, note};

    #[tokio::test(start_paused = true)]
    async fn test_union_survives_failures() {
        // A answers fast, B errors, C answers late with one overlap.
        let (a, b, c) = (endpoint("a"), endpoint("b"), endpoint("c"));
        let r1 = note(1, 1, 100);
        let r2 = note(2, 1, 200);
        let r3 = note(3, 1, 300);

        let transport = MockTransport::new();
        transport.reply(&a, Reply::records(vec![r1.clone(), r2.clone()]).after_ms(200));
        transport.reply(&b, Reply::error("connection refused"));
        transport.reply(&c, Reply::records(vec![r2.clone(), r3.clone()]).after_ms(4000));

        let fanout = Fanout::new(transport.clone());
        let started = tokio::time::Instant::now();
        let result = fanout
            .query(&[a.clone(), b, c.clone()], &Filter::new(), Duration::from_secs(5))
            .await;

        let ids: HashSet<RecordId> = result.records.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(result.records.len(), 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.seen_on[&r2.id], BTreeSet::from([a, c]));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4000) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_endpoint_cut_at_deadline() {
        let (a, b, c) = (endpoint("a"), endpoint("b"), endpoint("c"));
        let transport = MockTransport::new();
        transport.reply(&a, Reply::records(vec![note(1, 1, 100), note(2, 1, 200)]).after_ms(200));
        transport.reply(&b, Reply::hang());
        transport.reply(&c, Reply::records(vec![note(2, 1, 200), note(3, 1, 300)]).after_ms(4000));

        let fanout = Fanout::new(transport.clone());
        let started = tokio::time::Instant::now();
        let result = fanout
            .query(&[a, b, c], &Filter::new(), Duration::from_secs(5))
            .await;

        assert_eq!(result.records.len(), 3);
        assert_eq!(result.failed, 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_endpoints_queried_once() {
        let a = endpoint("a");
        let transport = MockTransport::new();
        transport.reply(&a, Reply::records(vec![note(1, 1, 100)]));

        let fanout = Fanout::new(transport.clone());
        let result = fanout
            .query(&[a.clone(), a.clone()], &Filter::new(), Duration::from_secs(1))
            .await;
        assert_eq!(result.succeeded, 1);
        assert_eq!(transport.query_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_required_fails_when_nobody_answers() {
        let (a, b) = (endpoint("a"), endpoint("b"));
        let transport = MockTransport::new();
        transport.reply(&a, Reply::error("boom"));
        transport.reply(&b, Reply::hang());

        let fanout = Fanout::new(transport.clone());
        let err = fanout
            .query_required(&[a, b], &Filter::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AllEndpointsFailed { attempted: 2 }));

        let err = fanout
            .query_required(&[], &Filter::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AllEndpointsFailed { attempted: 0 }));
    }

    #[test]
    fn test_query_is_counted() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let transport = MockTransport::new();
        transport.reply(&endpoint("a"), Reply::records(vec![note(1, 1, 100)]));
        let fanout = Fanout::new(transport);

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                for _ in 0..2 {
                    fanout
                        .query(&[endpoint("a")], &Filter::new(), Duration::from_secs(1))
                        .await;
                }
            })
        });

        assert!(handle.render().contains("fanout_queries_total 2"));
    }
}
