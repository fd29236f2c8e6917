// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Metrics Generator
//!
//! Turns a stream of trace spans into derived time-series metrics and pushes
//! them to a remote-write compatible store.
//!
//! ## Overview
//!
//! - [`ring`]: consistent-hashing membership ring and the per-instance
//!   [`ring::lifecycler::Lifecycler`] that registers tokens and heartbeats
//! - [`registry`]: lazily created per-tenant processor sets
//! - [`processor`]: service-graph and span-metrics aggregation engines
//! - [`remote_write`]: bounded export queue and the remote-write client
//! - [`generator`]: wires everything together and owns the background loops
//!
//! ```text
//! spans → Generator::push_spans → ring ownership → TenantRegistry
//!       → processors (in-memory aggregates) → flush → MetricSample batches
//!       → RemoteWriteExporter → HTTP push
//! ```

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

/// Configuration loading and validation
pub mod config;

/// Top-level generator errors
pub mod error;

/// Generator orchestration and background loops
pub mod generator;

/// Log line formatting
pub mod logger;

/// Span aggregation engines
pub mod processor;

/// Remote-write export path
pub mod remote_write;

/// Per-tenant processor registry
pub mod registry;

/// Membership ring and lifecycler
pub mod ring;

/// Immutable metric samples produced on flush
pub mod sample;

/// Span model consumed by the processors
pub mod span;

/// Current wall-clock time as milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
