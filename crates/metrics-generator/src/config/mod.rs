// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! ## Configuration Priority
//!
//! Sources are applied in the following order (later sources override earlier):
//!
//! 1. **Defaults** - [`Config::default`]
//! 2. **YAML file** - passed to [`Config::load`], if any
//! 3. **Environment variables** - `GENERATOR_` prefix, `__` separates nested
//!    keys (e.g. `GENERATOR_REMOTE_WRITE__ENDPOINT`)
//!
//! The merged result is validated before it is returned.
//!
//! ## Durations
//!
//! Durations are integer fields whose suffix names the unit (`_secs`, `_ms`).
//! Each section exposes `Duration` accessors.
//!
//! ## Example
//!
//! ```yaml
//! lifecycler:
//!   id: generator-0
//!   ring:
//!     replication_factor: 1
//!     heartbeat_timeout_secs: 300
//! processor:
//!   span_metrics:
//!     dimensions: ["http.method"]
//! remote_write:
//!   enabled: true
//!   endpoint: http://prometheus:9090/api/v1/write
//! overrides:
//!   tenant-a:
//!     max_active_series: 500
//! ```

pub mod hostname;
pub mod log_level;
pub mod overrides;

use crate::processor::histogram::{
    default_span_metrics_buckets, valid_bounds, DEFAULT_SERVICE_GRAPH_BUCKETS,
};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub use log_level::LogLevel;
pub use overrides::{TenantConfig, TenantOverrides};

/// Prefix of environment variables read by [`Config::load`].
pub const ENV_PREFIX: &str = "GENERATOR_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    pub lifecycler: LifecyclerConfig,
    pub processor: ProcessorConfig,
    pub registry: RegistryConfig,
    pub remote_write: RemoteWriteConfig,
    /// Per-tenant overrides keyed by tenant id.
    pub overrides: HashMap<String, TenantOverrides>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecyclerConfig {
    /// Instance id registered in the ring. Defaults to the hostname.
    pub id: String,
    /// Address advertised to peers.
    pub addr: String,
    pub ring: RingConfig,
    pub num_tokens: usize,
    pub heartbeat_period_ms: u64,
    /// Delay between registering tokens (JOINING) and turning ACTIVE.
    pub join_after_ms: u64,
    /// Remove the instance from the ring on shutdown. When false the instance
    /// stays LEAVING until an operator forgets it.
    pub unregister_on_shutdown: bool,
    /// Seed for token generation. Random when unset.
    pub tokens_seed: Option<u64>,
    pub shutdown_grace_period_secs: u64,
}

impl Default for LifecyclerConfig {
    fn default() -> Self {
        Self {
            id: hostname::get_hostname(),
            addr: "127.0.0.1:3200".to_string(),
            ring: RingConfig::default(),
            num_tokens: 128,
            heartbeat_period_ms: 5_000,
            join_after_ms: 0,
            unregister_on_shutdown: true,
            tokens_seed: None,
            shutdown_grace_period_secs: 30,
        }
    }
}

impl LifecyclerConfig {
    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    #[must_use]
    pub fn join_after(&self) -> Duration {
        Duration::from_millis(self.join_after_ms)
    }

    #[must_use]
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Prefix under which instance descriptors are stored.
    pub key: String,
    pub replication_factor: usize,
    pub heartbeat_timeout_secs: u64,
    /// Fallback refresh period when no change notification arrives.
    pub refresh_period_ms: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            key: "generator".to_string(),
            replication_factor: 1,
            heartbeat_timeout_secs: 300,
            refresh_period_ms: 1_000,
        }
    }
}

impl RingConfig {
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    #[must_use]
    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.refresh_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProcessorConfig {
    pub service_graphs: ServiceGraphsConfig,
    pub span_metrics: SpanMetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceGraphsConfig {
    pub enabled: bool,
    /// Completion deadline for a pending edge.
    pub wait_secs: u64,
    /// Maximum number of pending edges held at once.
    pub max_items: usize,
    pub histogram_buckets: Vec<f64>,
    /// Record expired half-edges against an `unknown` peer.
    pub record_unknown_peer_edges: bool,
}

impl Default for ServiceGraphsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_secs: 10,
            max_items: 10_000,
            histogram_buckets: DEFAULT_SERVICE_GRAPH_BUCKETS.to_vec(),
            record_unknown_peer_edges: false,
        }
    }
}

impl ServiceGraphsConfig {
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanMetricsConfig {
    pub enabled: bool,
    /// Span attributes promoted to labels.
    pub dimensions: Vec<String>,
    pub include_status_code: bool,
    pub histogram_buckets: Vec<f64>,
    /// Maximum distinct label combinations per flush interval.
    pub max_active_series: usize,
}

impl Default for SpanMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dimensions: Vec::new(),
            include_status_code: false,
            histogram_buckets: default_span_metrics_buckets(),
            max_active_series: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_tenants: usize,
    pub idle_timeout_secs: u64,
    pub flush_interval_secs: u64,
    /// How often the flush scheduler looks for tenants that are due.
    pub flush_check_period_ms: u64,
    /// Period of the pending-edge expiry and idle-tenant sweep.
    pub sweep_period_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tenants: 1_000,
            idle_timeout_secs: 900,
            flush_interval_secs: 15,
            flush_check_period_ms: 1_000,
            sweep_period_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn flush_check_period(&self) -> Duration {
        Duration::from_millis(self.flush_check_period_ms)
    }

    #[must_use]
    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteWriteConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub basic_auth: Option<BasicAuth>,
    /// Static headers added to every request.
    pub headers: HashMap<String, String>,
    /// Labels appended to every exported series.
    pub external_labels: HashMap<String, String>,
    pub timeout_secs: u64,
    pub flush_interval_secs: u64,
    /// Maximum queued batches before the oldest is dropped.
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RemoteWriteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            basic_auth: None,
            headers: HashMap::new(),
            external_labels: HashMap::new(),
            timeout_secs: 5,
            flush_interval_secs: 15,
            queue_capacity: 1_000,
            max_attempts: 5,
            min_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RemoteWriteConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    #[must_use]
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    /// Loads defaults, then `path` (if given), then `GENERATOR_*` environment
    /// variables, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.lifecycler.id.trim().is_empty() {
            return invalid("lifecycler.id cannot be empty");
        }
        if self.lifecycler.ring.key.trim().is_empty() {
            return invalid("lifecycler.ring.key cannot be empty");
        }
        if self.lifecycler.ring.replication_factor == 0 {
            return invalid("lifecycler.ring.replication_factor must be at least 1");
        }
        if self.lifecycler.num_tokens == 0 {
            return invalid("lifecycler.num_tokens must be at least 1");
        }
        if self.lifecycler.heartbeat_period_ms == 0 {
            return invalid("lifecycler.heartbeat_period_ms must be greater than 0");
        }
        if self.lifecycler.ring.heartbeat_timeout_secs == 0 {
            return invalid("lifecycler.ring.heartbeat_timeout_secs must be greater than 0");
        }
        if self.lifecycler.ring.refresh_period_ms == 0 {
            return invalid("lifecycler.ring.refresh_period_ms must be greater than 0");
        }
        if !valid_bounds(&self.processor.service_graphs.histogram_buckets) {
            return invalid("processor.service_graphs.histogram_buckets must be strictly increasing");
        }
        if !valid_bounds(&self.processor.span_metrics.histogram_buckets) {
            return invalid("processor.span_metrics.histogram_buckets must be strictly increasing");
        }
        if self.registry.flush_interval_secs == 0 {
            return invalid("registry.flush_interval_secs must be greater than 0");
        }
        if self.registry.flush_check_period_ms == 0 {
            return invalid("registry.flush_check_period_ms must be greater than 0");
        }
        if self.registry.sweep_period_ms == 0 {
            return invalid("registry.sweep_period_ms must be greater than 0");
        }
        if self.remote_write.flush_interval_secs == 0 {
            return invalid("remote_write.flush_interval_secs must be greater than 0");
        }
        if self.remote_write.queue_capacity == 0 {
            return invalid("remote_write.queue_capacity must be at least 1");
        }
        if self.remote_write.max_attempts == 0 {
            return invalid("remote_write.max_attempts must be at least 1");
        }
        if self.remote_write.min_backoff_ms > self.remote_write.max_backoff_ms {
            return invalid("remote_write.min_backoff_ms cannot exceed max_backoff_ms");
        }
        if self.remote_write.enabled {
            if let Err(e) = reqwest::Url::parse(&self.remote_write.endpoint) {
                return Err(ConfigError::Invalid(format!(
                    "remote_write.endpoint '{}' is not a valid URL: {e}",
                    self.remote_write.endpoint
                )));
            }
        }
        for (tenant, overrides) in &self.overrides {
            overrides
                .validate()
                .map_err(|msg| ConfigError::Invalid(format!("overrides.{tenant}: {msg}")))?;
        }
        Ok(())
    }

    /// Effective settings for `tenant`, with overrides applied.
    #[must_use]
    pub fn tenant(&self, tenant: &str) -> TenantConfig {
        TenantConfig::resolve(self, self.overrides.get(tenant))
    }
}
