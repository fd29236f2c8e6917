// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tenant overrides.
//!
//! Every field is optional; unset fields fall back to the global value.

use super::{Config, ServiceGraphsConfig, SpanMetricsConfig};
use crate::processor::ProcessorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TenantOverrides {
    /// Processors to run for this tenant. Replaces the globally enabled set.
    pub processors: Option<Vec<ProcessorKind>>,
    pub span_metrics_dimensions: Option<Vec<String>>,
    pub max_active_series: Option<usize>,
    pub service_graphs_wait_secs: Option<u64>,
    pub flush_interval_secs: Option<u64>,
    pub replication_factor: Option<usize>,
}

impl TenantOverrides {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.replication_factor == Some(0) {
            return Err("replication_factor must be at least 1".to_string());
        }
        if self.flush_interval_secs == Some(0) {
            return Err("flush_interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Effective configuration of one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantConfig {
    pub processors: Vec<ProcessorKind>,
    pub service_graphs: ServiceGraphsConfig,
    pub span_metrics: SpanMetricsConfig,
    pub flush_interval: Duration,
    pub replication_factor: usize,
}

impl TenantConfig {
    pub(crate) fn resolve(config: &Config, overrides: Option<&TenantOverrides>) -> Self {
        let mut service_graphs = config.processor.service_graphs.clone();
        let mut span_metrics = config.processor.span_metrics.clone();
        let mut flush_interval = Duration::from_secs(config.registry.flush_interval_secs);
        let mut replication_factor = config.lifecycler.ring.replication_factor;

        let mut processors = Vec::with_capacity(2);
        if service_graphs.enabled {
            processors.push(ProcessorKind::ServiceGraphs);
        }
        if span_metrics.enabled {
            processors.push(ProcessorKind::SpanMetrics);
        }

        if let Some(o) = overrides {
            if let Some(kinds) = &o.processors {
                processors.clone_from(kinds);
                processors.dedup();
            }
            if let Some(dimensions) = &o.span_metrics_dimensions {
                span_metrics.dimensions.clone_from(dimensions);
            }
            if let Some(max) = o.max_active_series {
                span_metrics.max_active_series = max;
            }
            if let Some(wait) = o.service_graphs_wait_secs {
                service_graphs.wait_secs = wait;
            }
            if let Some(secs) = o.flush_interval_secs {
                flush_interval = Duration::from_secs(secs);
            }
            if let Some(rf) = o.replication_factor {
                replication_factor = rf;
            }
        }

        TenantConfig {
            processors,
            service_graphs,
            span_metrics,
            flush_interval,
            replication_factor,
        }
    }
}
