// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span metrics processor: calls, errors and latency per label combination.

use super::histogram::Histogram;
use super::{lock, seconds, ProcessorStats};
use crate::config::SpanMetricsConfig;
use crate::sample::{Labels, MetricSample};
use crate::span::Span;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const CALLS_TOTAL: &str = "traces_spanmetrics_calls_total";
pub const ERRORS_TOTAL: &str = "traces_spanmetrics_errors_total";
pub const DURATION_SECONDS: &str = "traces_spanmetrics_duration_seconds";

#[derive(Debug)]
struct SeriesAggregate {
    calls: u64,
    errors: u64,
    latency: Histogram,
}

pub struct SpanMetricsProcessor {
    config: SpanMetricsConfig,
    /// `(attribute key, label name)` for every configured dimension.
    dimensions: Vec<(String, String)>,
    bounds: Arc<[f64]>,
    series: Mutex<HashMap<Labels, SeriesAggregate>>,
    overflow_series: AtomicU64,
}

impl SpanMetricsProcessor {
    #[must_use]
    pub fn new(config: SpanMetricsConfig) -> Self {
        let dimensions = config
            .dimensions
            .iter()
            .map(|d| (d.clone(), sanitize_label_name(d)))
            .collect();
        let bounds: Arc<[f64]> = Arc::from(config.histogram_buckets.clone());
        SpanMetricsProcessor {
            config,
            dimensions,
            bounds,
            series: Mutex::new(HashMap::new()),
            overflow_series: AtomicU64::new(0),
        }
    }

    pub fn push_span(&self, span: &Span) {
        let labels = self.labels_for(span);
        let duration = seconds(span.duration());
        let failed = span.is_error();

        let mut series = lock(&self.series);
        if series.len() >= self.config.max_active_series && !series.contains_key(&labels) {
            drop(series);
            let total = self.overflow_series.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Span metrics series limit reached, {total} spans rejected so far");
            return;
        }
        let agg = series.entry(labels).or_insert_with(|| SeriesAggregate {
            calls: 0,
            errors: 0,
            latency: Histogram::new(Arc::clone(&self.bounds)),
        });
        agg.calls += 1;
        if failed {
            agg.errors += 1;
        }
        agg.latency.observe(duration);
    }

    pub fn collect(&self, timestamp_ms: i64) -> Vec<MetricSample> {
        let series = std::mem::take(&mut *lock(&self.series));

        let mut samples = Vec::with_capacity(series.len() * 3);
        for (labels, agg) in series {
            samples.push(MetricSample::counter(
                CALLS_TOTAL,
                labels.clone(),
                timestamp_ms,
                agg.calls as f64,
            ));
            samples.push(MetricSample::counter(
                ERRORS_TOTAL,
                labels.clone(),
                timestamp_ms,
                agg.errors as f64,
            ));
            samples.push(MetricSample::histogram(
                DURATION_SECONDS,
                labels,
                timestamp_ms,
                agg.latency.snapshot(),
            ));
        }
        samples
    }

    #[must_use]
    pub fn active_series(&self) -> usize {
        lock(&self.series).len()
    }

    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            overflow_series: self.overflow_series.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn labels_for(&self, span: &Span) -> Labels {
        let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(4 + self.dimensions.len());
        pairs.push(("service", span.service_name.as_str()));
        pairs.push(("span_name", span.name.as_str()));
        pairs.push(("span_kind", span.kind.as_str()));
        if self.config.include_status_code {
            pairs.push(("status_code", span.status.as_str()));
        }
        for (attribute, label) in &self.dimensions {
            let value = span.attributes.get(attribute).map_or("", String::as_str);
            pairs.push((label.as_str(), value));
        }
        Labels::new(pairs)
    }
}

/// Maps an attribute key onto a valid Prometheus label name.
#[must_use]
pub fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
