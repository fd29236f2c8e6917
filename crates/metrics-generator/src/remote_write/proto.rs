// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus remote-write 1.0 messages and sample conversion.

use crate::sample::{ExportBatch, Labels, MetricSample, SampleValue};
use prost::Message;
use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeSeries {
    /// Sorted by name, `__name__` included.
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Unix milliseconds.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl TimeSeries {
    /// Value of label `name`, if present.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}

/// Converts a batch into a write request. Histograms expand into
/// `_bucket{le}`, `_sum` and `_count` series. External labels are added to
/// every series unless the series already carries that label.
#[must_use]
pub fn write_request(batch: &ExportBatch, external_labels: &HashMap<String, String>) -> WriteRequest {
    let mut timeseries = Vec::with_capacity(batch.len());
    for sample in &batch.samples {
        push_sample(&mut timeseries, sample, external_labels);
    }
    WriteRequest { timeseries }
}

/// Snappy block-compressed protobuf body.
pub fn encode(request: &WriteRequest) -> Result<Vec<u8>, snap::Error> {
    snap::raw::Encoder::new().compress_vec(&request.encode_to_vec())
}

fn push_sample(
    out: &mut Vec<TimeSeries>,
    sample: &MetricSample,
    external_labels: &HashMap<String, String>,
) {
    let ts = sample.timestamp_ms;
    match &sample.value {
        SampleValue::Counter(value) => {
            out.push(series(&sample.name, &sample.labels, None, external_labels, *value, ts));
        }
        SampleValue::Histogram(snapshot) => {
            let bucket = format!("{}_bucket", sample.name);
            for (le, count) in snapshot.buckets() {
                out.push(series(
                    &bucket,
                    &sample.labels,
                    Some(format_le(le)),
                    external_labels,
                    count as f64,
                    ts,
                ));
            }
            out.push(series(
                &format!("{}_sum", sample.name),
                &sample.labels,
                None,
                external_labels,
                snapshot.sum,
                ts,
            ));
            out.push(series(
                &format!("{}_count", sample.name),
                &sample.labels,
                None,
                external_labels,
                snapshot.count as f64,
                ts,
            ));
        }
    }
}

fn series(
    name: &str,
    labels: &Labels,
    le: Option<String>,
    external_labels: &HashMap<String, String>,
    value: f64,
    timestamp: i64,
) -> TimeSeries {
    let mut out: Vec<Label> = Vec::with_capacity(labels.len() + external_labels.len() + 2);
    out.push(Label {
        name: "__name__".to_string(),
        value: name.to_string(),
    });
    out.extend(labels.iter().map(|(k, v)| Label {
        name: k.to_string(),
        value: v.to_string(),
    }));
    if let Some(le) = le {
        out.push(Label {
            name: "le".to_string(),
            value: le,
        });
    }
    for (k, v) in external_labels {
        if labels.get(k).is_none() {
            out.push(Label {
                name: k.clone(),
                value: v.clone(),
            });
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out.dedup_by(|a, b| a.name == b.name);

    TimeSeries {
        labels: out,
        samples: vec![Sample { value, timestamp }],
    }
}

fn format_le(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        bound.to_string()
    }
}
