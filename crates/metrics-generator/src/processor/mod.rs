// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span aggregation engines.
//!
//! A tenant runs a fixed, small set of processors selected by configuration:
//!
//! - **`service_graphs`**: pairs client and server spans of one call into
//!   caller → callee edges
//! - **`span_metrics`**: request, error and latency series per label set
//!
//! # Concurrency
//!
//! Processors are shared by every ingestion path of a tenant. Each keeps its
//! aggregates behind a single mutex; a flush swaps the whole map out under
//! that mutex, so an increment lands either before the swap (and is exported
//! by this flush) or after it (and is exported by the next one), never both.
//! Locks are never held across an `.await`.

pub mod histogram;
pub mod service_graphs;
pub mod span_metrics;

use crate::config::TenantConfig;
use crate::sample::MetricSample;
use crate::span::Span;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub use service_graphs::ServiceGraphsProcessor;
pub use span_metrics::SpanMetricsProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorKind {
    ServiceGraphs,
    SpanMetrics,
}

impl ProcessorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::ServiceGraphs => "service-graphs",
            ProcessorKind::SpanMetrics => "span-metrics",
        }
    }
}

/// Drop and completion counts reported by a processor since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub completed_edges: u64,
    pub expired_edges: u64,
    pub dropped_spans: u64,
    pub overflow_series: u64,
}

impl std::ops::AddAssign for ProcessorStats {
    fn add_assign(&mut self, other: Self) {
        self.completed_edges += other.completed_edges;
        self.expired_edges += other.expired_edges;
        self.dropped_spans += other.dropped_spans;
        self.overflow_series += other.overflow_series;
    }
}

pub enum Processor {
    ServiceGraphs(ServiceGraphsProcessor),
    SpanMetrics(SpanMetricsProcessor),
}

impl Processor {
    #[must_use]
    pub fn new(kind: ProcessorKind, config: &TenantConfig) -> Self {
        match kind {
            ProcessorKind::ServiceGraphs => {
                Processor::ServiceGraphs(ServiceGraphsProcessor::new(config.service_graphs.clone()))
            }
            ProcessorKind::SpanMetrics => {
                Processor::SpanMetrics(SpanMetricsProcessor::new(config.span_metrics.clone()))
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> ProcessorKind {
        match self {
            Processor::ServiceGraphs(_) => ProcessorKind::ServiceGraphs,
            Processor::SpanMetrics(_) => ProcessorKind::SpanMetrics,
        }
    }

    pub fn push_span(&self, span: &Span, now: Instant) {
        match self {
            Processor::ServiceGraphs(p) => p.push_span(span, now),
            Processor::SpanMetrics(p) => p.push_span(span),
        }
    }

    /// Evicts state older than the processor's completion deadline. Returns
    /// the number of evicted entries.
    pub fn expire(&self, now: Instant) -> usize {
        match self {
            Processor::ServiceGraphs(p) => p.expire(now),
            Processor::SpanMetrics(_) => 0,
        }
    }

    /// Evicts all pending state, as on tenant removal.
    pub fn expire_all(&self) -> usize {
        match self {
            Processor::ServiceGraphs(p) => p.expire_all(),
            Processor::SpanMetrics(_) => 0,
        }
    }

    /// Converts the aggregates of the current interval into samples and
    /// resets them.
    pub fn collect(&self, timestamp_ms: i64) -> Vec<MetricSample> {
        match self {
            Processor::ServiceGraphs(p) => p.collect(timestamp_ms),
            Processor::SpanMetrics(p) => p.collect(timestamp_ms),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        match self {
            Processor::ServiceGraphs(p) => p.stats(),
            Processor::SpanMetrics(p) => p.stats(),
        }
    }
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
/// Aggregates are plain counters, so a half-applied update is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts a duration to fractional seconds for histogram observations.
pub(crate) fn seconds(d: std::time::Duration) -> f64 {
    d.as_secs_f64()
}
