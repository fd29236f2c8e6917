// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span records as handed over by the ingestion layer.
//!
//! The generator does not care how spans travel to it; it only needs the
//! fields below. Spans are validated once on dispatch and every processor
//! can then rely on non-empty identifiers and a sane time range.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

/// Role of a span within a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "SPAN_KIND_UNSPECIFIED",
            SpanKind::Internal => "SPAN_KIND_INTERNAL",
            SpanKind::Server => "SPAN_KIND_SERVER",
            SpanKind::Client => "SPAN_KIND_CLIENT",
            SpanKind::Producer => "SPAN_KIND_PRODUCER",
            SpanKind::Consumer => "SPAN_KIND_CONSUMER",
        }
    }
}

/// Span status as reported by the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unset,
    Ok,
    Error,
}

impl Status {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unset => "STATUS_CODE_UNSET",
            Status::Ok => "STATUS_CODE_OK",
            Status::Error => "STATUS_CODE_ERROR",
        }
    }
}

/// Reasons a span is rejected before reaching any processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("span has an empty trace id")]
    MissingTraceId,

    #[error("span has an empty span id")]
    MissingSpanId,

    #[error("span has an empty service name")]
    MissingServiceName,

    #[error("span ends ({end}) before it starts ({start})")]
    InvalidTimestamps { start: u64, end: u64 },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Span {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    /// Empty for root spans.
    pub parent_span_id: Vec<u8>,
    pub service_name: String,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status: Status,
    pub attributes: HashMap<String, String>,
}

/// Which side of a call a span represents for service-graph pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSide {
    Client,
    Server,
}

impl Span {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.trace_id.is_empty() {
            return Err(IngestError::MissingTraceId);
        }
        if self.span_id.is_empty() {
            return Err(IngestError::MissingSpanId);
        }
        if self.service_name.trim().is_empty() {
            return Err(IngestError::MissingServiceName);
        }
        if self.end_time_unix_nano < self.start_time_unix_nano {
            return Err(IngestError::InvalidTimestamps {
                start: self.start_time_unix_nano,
                end: self.end_time_unix_nano,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(
            self.end_time_unix_nano
                .saturating_sub(self.start_time_unix_nano),
        )
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// Returns the side this span plays in a client/server pair together with
    /// the key shared by both sides, or `None` if the span cannot be paired.
    ///
    /// A client span is keyed by its own id, a server span by its parent id,
    /// so the two halves of one call meet under the same key.
    #[must_use]
    pub fn correlation(&self) -> Option<(EdgeSide, String)> {
        match self.kind {
            SpanKind::Client => Some((EdgeSide::Client, correlation_key(&self.trace_id, &self.span_id))),
            SpanKind::Server if !self.parent_span_id.is_empty() => Some((
                EdgeSide::Server,
                correlation_key(&self.trace_id, &self.parent_span_id),
            )),
            _ => None,
        }
    }
}

fn correlation_key(trace_id: &[u8], span_id: &[u8]) -> String {
    let mut key = String::with_capacity((trace_id.len() + span_id.len()) * 2 + 1);
    for b in trace_id {
        let _ = write!(key, "{b:02x}");
    }
    key.push(':');
    for b in span_id {
        let _ = write!(key, "{b:02x}");
    }
    key
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::{Span, SpanKind, Status};

    pub(crate) const MS: u64 = 1_000_000;

    /// Builds a span starting at t=1s with the given duration in milliseconds.
    pub(crate) fn span(
        service: &str,
        kind: SpanKind,
        trace: u8,
        id: u8,
        parent: Option<u8>,
        duration_ms: u64,
        status: Status,
    ) -> Span {
        Span {
            trace_id: vec![trace; 16],
            span_id: vec![id; 8],
            parent_span_id: parent.map(|p| vec![p; 8]).unwrap_or_default(),
            service_name: service.to_string(),
            name: "GET /x".to_string(),
            kind,
            start_time_unix_nano: 1_000 * MS,
            end_time_unix_nano: 1_000 * MS + duration_ms * MS,
            status,
            attributes: Default::default(),
        }
    }
}
