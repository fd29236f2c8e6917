// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-boundary duration histograms.
//!
//! All histograms of one processor share the same upper bounds so that the
//! exported `le` label sets stay stable over time. Observations are stored
//! per bucket and converted to cumulative counts on snapshot.

use std::sync::Arc;

/// Default service graph latency buckets, in seconds.
pub const DEFAULT_SERVICE_GRAPH_BUCKETS: [f64; 8] = [0.1, 0.2, 0.4, 0.8, 1.6, 3.2, 6.4, 12.8];

/// Default span metrics latency buckets: 2ms doubling 14 times, in seconds.
#[must_use]
pub fn default_span_metrics_buckets() -> Vec<f64> {
    (0..14).map(|k| 0.002 * f64::from(1u32 << k)).collect()
}

/// Returns true when `bounds` is non-empty, finite and strictly increasing.
#[must_use]
pub fn valid_bounds(bounds: &[f64]) -> bool {
    !bounds.is_empty()
        && bounds.iter().all(|b| b.is_finite())
        && bounds.windows(2).all(|w| w[0] < w[1])
}

#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Arc<[f64]>,
    /// One slot per bound plus a trailing `+Inf` slot. Not cumulative.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    #[must_use]
    pub fn new(bounds: Arc<[f64]>) -> Self {
        let slots = bounds.len() + 1;
        Histogram {
            bounds,
            counts: vec![0; slots],
            sum: 0.0,
            count: 0,
        }
    }

    /// Records one observation. A value lands in the first bucket whose upper
    /// bound is greater than or equal to it.
    pub fn observe(&mut self, value: f64) {
        let idx = self.bounds.partition_point(|b| *b < value);
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut running = 0;
        let cumulative = self.counts[..self.bounds.len()]
            .iter()
            .map(|c| {
                running += c;
                running
            })
            .collect();
        HistogramSnapshot {
            bounds: Arc::clone(&self.bounds),
            cumulative,
            sum: self.sum,
            count: self.count,
        }
    }
}

/// Immutable view of a histogram at flush time.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    pub bounds: Arc<[f64]>,
    /// Cumulative count for each entry of `bounds`; the `+Inf` bucket is `count`.
    pub cumulative: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    /// Iterates `(upper_bound, cumulative_count)` including the `+Inf` bucket.
    pub fn buckets(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.bounds
            .iter()
            .copied()
            .zip(self.cumulative.iter().copied())
            .chain(std::iter::once((f64::INFINITY, self.count)))
    }
}
