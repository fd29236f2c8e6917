// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service graph processor.
//!
//! Rebuilds caller → callee edges from the client and the server span of one
//! call. The two halves arrive independently and in any order; the first one
//! waits in the pending store under its correlation key until the other shows
//! up or the completion deadline passes.
//!
//! State lives behind two mutexes that are never held together: `pending`
//! for half-edges and `interval` for the aggregates of the current flush
//! interval.

use super::histogram::Histogram;
use super::{lock, seconds, ProcessorStats};
use crate::config::ServiceGraphsConfig;
use crate::sample::{Labels, MetricSample};
use crate::span::{EdgeSide, Span};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

pub const REQUEST_TOTAL: &str = "traces_service_graph_request_total";
pub const REQUEST_FAILED_TOTAL: &str = "traces_service_graph_request_failed_total";
pub const REQUEST_CLIENT_SECONDS: &str = "traces_service_graph_request_client_seconds";
pub const REQUEST_SERVER_SECONDS: &str = "traces_service_graph_request_server_seconds";
pub const UNPAIRED_SPANS_TOTAL: &str = "traces_service_graph_unpaired_spans_total";
pub const DROPPED_SPANS_TOTAL: &str = "traces_service_graph_dropped_spans_total";

/// Peer name used for half-edges whose counterpart never arrived.
pub const UNKNOWN_PEER: &str = "unknown";

#[derive(Debug, Clone)]
struct SpanSummary {
    service: String,
    duration: Duration,
    failed: bool,
}

impl SpanSummary {
    fn from_span(span: &Span) -> Self {
        SpanSummary {
            service: span.service_name.clone(),
            duration: span.duration(),
            failed: span.is_error(),
        }
    }
}

#[derive(Debug)]
struct PendingEdge {
    client: Option<SpanSummary>,
    server: Option<SpanSummary>,
    first_seen: Instant,
}

impl PendingEdge {
    fn new(side: EdgeSide, summary: SpanSummary, now: Instant) -> Self {
        let mut edge = PendingEdge {
            client: None,
            server: None,
            first_seen: now,
        };
        edge.set(side, summary);
        edge
    }

    fn has(&self, side: EdgeSide) -> bool {
        match side {
            EdgeSide::Client => self.client.is_some(),
            EdgeSide::Server => self.server.is_some(),
        }
    }

    fn set(&mut self, side: EdgeSide, summary: SpanSummary) {
        match side {
            EdgeSide::Client => self.client = Some(summary),
            EdgeSide::Server => self.server = Some(summary),
        }
    }

    fn is_expired(&self, now: Instant, wait: Duration) -> bool {
        now.saturating_duration_since(self.first_seen) > wait
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    client: String,
    server: String,
}

#[derive(Debug)]
struct EdgeAggregate {
    requests: u64,
    failed: u64,
    client_latency: Histogram,
    server_latency: Histogram,
}

impl EdgeAggregate {
    fn new(bounds: &Arc<[f64]>) -> Self {
        EdgeAggregate {
            requests: 0,
            failed: 0,
            client_latency: Histogram::new(Arc::clone(bounds)),
            server_latency: Histogram::new(Arc::clone(bounds)),
        }
    }
}

/// Aggregates of one flush interval. Swapped out wholesale on collect.
#[derive(Debug, Default)]
struct IntervalState {
    edges: HashMap<EdgeKey, EdgeAggregate>,
    unpaired: HashMap<(&'static str, String), u64>,
    dropped: u64,
}

impl IntervalState {
    fn edge(&mut self, key: EdgeKey, bounds: &Arc<[f64]>) -> &mut EdgeAggregate {
        self.edges
            .entry(key)
            .or_insert_with(|| EdgeAggregate::new(bounds))
    }
}

/// What a single ingest did to the pending store. Applied to the interval
/// aggregates after the pending lock is released.
enum Outcome {
    Waiting,
    Completed(PendingEdge),
    Expired(PendingEdge),
    Dropped,
}

pub struct ServiceGraphsProcessor {
    config: ServiceGraphsConfig,
    bounds: Arc<[f64]>,
    pending: Mutex<HashMap<String, PendingEdge>>,
    interval: Mutex<IntervalState>,
    completed_edges: AtomicU64,
    expired_edges: AtomicU64,
    dropped_spans: AtomicU64,
}

impl ServiceGraphsProcessor {
    #[must_use]
    pub fn new(config: ServiceGraphsConfig) -> Self {
        let bounds: Arc<[f64]> = Arc::from(config.histogram_buckets.clone());
        ServiceGraphsProcessor {
            config,
            bounds,
            pending: Mutex::new(HashMap::new()),
            interval: Mutex::new(IntervalState::default()),
            completed_edges: AtomicU64::new(0),
            expired_edges: AtomicU64::new(0),
            dropped_spans: AtomicU64::new(0),
        }
    }

    pub fn push_span(&self, span: &Span, now: Instant) {
        let Some((side, key)) = span.correlation() else {
            return;
        };
        let summary = SpanSummary::from_span(span);
        let wait = self.config.wait();

        let outcome = {
            let mut pending = lock(&self.pending);
            let full = pending.len() >= self.config.max_items;
            match pending.entry(key) {
                Entry::Occupied(mut entry) => {
                    if entry.get().is_expired(now, wait) {
                        // Too late to match; the stale half is accounted for
                        // and this span starts a fresh wait.
                        Outcome::Expired(entry.insert(PendingEdge::new(side, summary, now)))
                    } else if entry.get().has(side) {
                        entry.get_mut().set(side, summary);
                        Outcome::Waiting
                    } else {
                        let mut edge = entry.remove();
                        edge.set(side, summary);
                        Outcome::Completed(edge)
                    }
                }
                Entry::Vacant(_) if full => Outcome::Dropped,
                Entry::Vacant(entry) => {
                    entry.insert(PendingEdge::new(side, summary, now));
                    Outcome::Waiting
                }
            }
        };

        match outcome {
            Outcome::Waiting => {}
            Outcome::Completed(edge) => self.record_completed(edge),
            Outcome::Expired(edge) => self.record_expired(vec![edge]),
            Outcome::Dropped => {
                self.dropped_spans.fetch_add(1, Ordering::Relaxed);
                lock(&self.interval).dropped += 1;
            }
        }
    }

    /// Evicts every pending edge past the completion deadline and records it
    /// as unpaired. Returns the number of evicted edges.
    pub fn expire(&self, now: Instant) -> usize {
        let wait = self.config.wait();
        self.evict(|edge| edge.is_expired(now, wait))
    }

    /// Evicts every pending edge regardless of age and records it as
    /// unpaired. Used when the tenant goes away.
    pub fn expire_all(&self) -> usize {
        self.evict(|_| true)
    }

    fn evict(&self, mut should_evict: impl FnMut(&PendingEdge) -> bool) -> usize {
        let mut expired = Vec::new();
        lock(&self.pending).retain(|_, edge| {
            if should_evict(edge) {
                expired.push(PendingEdge {
                    client: edge.client.take(),
                    server: edge.server.take(),
                    first_seen: edge.first_seen,
                });
                false
            } else {
                true
            }
        });

        let count = expired.len();
        if count > 0 {
            debug!("Expired {count} pending service graph edges");
            self.record_expired(expired);
        }
        count
    }

    pub fn collect(&self, timestamp_ms: i64) -> Vec<MetricSample> {
        let state = std::mem::take(&mut *lock(&self.interval));

        let mut samples = Vec::with_capacity(state.edges.len() * 4 + state.unpaired.len() + 1);
        for (key, agg) in state.edges {
            let labels = Labels::new([("client", key.client), ("server", key.server)]);
            samples.push(MetricSample::counter(
                REQUEST_TOTAL,
                labels.clone(),
                timestamp_ms,
                agg.requests as f64,
            ));
            samples.push(MetricSample::counter(
                REQUEST_FAILED_TOTAL,
                labels.clone(),
                timestamp_ms,
                agg.failed as f64,
            ));
            if agg.client_latency.count() > 0 {
                samples.push(MetricSample::histogram(
                    REQUEST_CLIENT_SECONDS,
                    labels.clone(),
                    timestamp_ms,
                    agg.client_latency.snapshot(),
                ));
            }
            if agg.server_latency.count() > 0 {
                samples.push(MetricSample::histogram(
                    REQUEST_SERVER_SECONDS,
                    labels,
                    timestamp_ms,
                    agg.server_latency.snapshot(),
                ));
            }
        }
        for ((side, service), count) in state.unpaired {
            samples.push(MetricSample::counter(
                UNPAIRED_SPANS_TOTAL,
                Labels::new([(side, service)]),
                timestamp_ms,
                count as f64,
            ));
        }
        if state.dropped > 0 {
            samples.push(MetricSample::counter(
                DROPPED_SPANS_TOTAL,
                Labels::default(),
                timestamp_ms,
                state.dropped as f64,
            ));
        }
        samples
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            completed_edges: self.completed_edges.load(Ordering::Relaxed),
            expired_edges: self.expired_edges.load(Ordering::Relaxed),
            dropped_spans: self.dropped_spans.load(Ordering::Relaxed),
            overflow_series: 0,
        }
    }

    fn record_completed(&self, edge: PendingEdge) {
        let (Some(client), Some(server)) = (edge.client, edge.server) else {
            return;
        };
        self.completed_edges.fetch_add(1, Ordering::Relaxed);

        let key = EdgeKey {
            client: client.service,
            server: server.service,
        };
        let mut state = lock(&self.interval);
        let agg = state.edge(key, &self.bounds);
        agg.requests += 1;
        if client.failed || server.failed {
            agg.failed += 1;
        }
        agg.client_latency.observe(seconds(client.duration));
        agg.server_latency.observe(seconds(server.duration));
    }

    fn record_expired(&self, edges: Vec<PendingEdge>) {
        self.expired_edges
            .fetch_add(edges.len() as u64, Ordering::Relaxed);

        let mut state = lock(&self.interval);
        for edge in edges {
            if let Some(client) = edge.client {
                *state
                    .unpaired
                    .entry(("client", client.service.clone()))
                    .or_default() += 1;
                if self.config.record_unknown_peer_edges {
                    let agg = state.edge(
                        EdgeKey {
                            client: client.service,
                            server: UNKNOWN_PEER.to_string(),
                        },
                        &self.bounds,
                    );
                    agg.requests += 1;
                    if client.failed {
                        agg.failed += 1;
                    }
                    agg.client_latency.observe(seconds(client.duration));
                }
            }
            if let Some(server) = edge.server {
                *state
                    .unpaired
                    .entry(("server", server.service.clone()))
                    .or_default() += 1;
                if self.config.record_unknown_peer_edges {
                    let agg = state.edge(
                        EdgeKey {
                            client: UNKNOWN_PEER.to_string(),
                            server: server.service,
                        },
                        &self.bounds,
                    );
                    agg.requests += 1;
                    if server.failed {
                        agg.failed += 1;
                    }
                    agg.server_latency.observe(seconds(server.duration));
                }
            }
        }
    }
}
