// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Immutable metric samples.
//!
//! Processors convert their aggregates into [`MetricSample`]s on flush. From
//! that point on a sample is never mutated: it is grouped into an
//! [`ExportBatch`] and owned by the exporter until delivered or dropped.

use crate::processor::histogram::HistogramSnapshot;

/// Label set kept sorted by label name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        labels.dedup_by(|a, b| a.0 == b.0);
        Labels(labels)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    /// Increase observed during the flush interval.
    Counter(f64),
    Histogram(HistogramSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Labels,
    pub timestamp_ms: i64,
    pub value: SampleValue,
}

impl MetricSample {
    #[must_use]
    pub fn counter(name: &str, labels: Labels, timestamp_ms: i64, value: f64) -> Self {
        MetricSample {
            name: name.to_string(),
            labels,
            timestamp_ms,
            value: SampleValue::Counter(value),
        }
    }

    #[must_use]
    pub fn histogram(
        name: &str,
        labels: Labels,
        timestamp_ms: i64,
        snapshot: HistogramSnapshot,
    ) -> Self {
        MetricSample {
            name: name.to_string(),
            labels,
            timestamp_ms,
            value: SampleValue::Histogram(snapshot),
        }
    }

    /// Counter value, `None` for histograms.
    #[must_use]
    pub fn as_counter(&self) -> Option<f64> {
        match self.value {
            SampleValue::Counter(v) => Some(v),
            SampleValue::Histogram(_) => None,
        }
    }
}

/// All samples one tenant produced in one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    pub tenant: String,
    pub samples: Vec<MetricSample>,
}

impl ExportBatch {
    #[must_use]
    pub fn new(tenant: impl Into<String>, samples: Vec<MetricSample>) -> Self {
        ExportBatch {
            tenant: tenant.into(),
            samples,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// First sample matching `name` whose labels contain every `(k, v)` pair.
    #[must_use]
    pub fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&MetricSample> {
        self.samples.iter().find(|s| {
            s.name == name && labels.iter().all(|(k, v)| s.labels.get(k) == Some(*v))
        })
    }
}
