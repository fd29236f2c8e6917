// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tenant processor sets.
//!
//! Tenants are created on their first span and removed after staying idle
//! for `idle_timeout`. Each tenant has its own flush deadline derived from
//! its (possibly overridden) flush interval; a single scheduler calls
//! [`TenantRegistry::flush_due`] and only the tenants whose deadline passed
//! are collected.
//!
//! A swept tenant is retired before it is collected: a dispatcher that
//! still holds the old handle sees the retirement and retries against a
//! fresh tenant, so no span lands in state nobody will flush again.

use crate::config::{Config, TenantConfig};
use crate::processor::{lock, Processor, ProcessorStats};
use crate::sample::ExportBatch;
use crate::span::{IngestError, Span};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("tenant id cannot be empty")]
    EmptyTenant,

    #[error("tenant limit of {0} reached")]
    TenantLimit(usize),

    #[error("malformed span: {0}")]
    Malformed(#[from] IngestError),
}

pub struct Tenant {
    id: String,
    config: TenantConfig,
    processors: Vec<Processor>,
    last_activity: Mutex<Instant>,
    next_flush: Mutex<Instant>,
    /// Held shared while spans are pushed; set under the exclusive lock
    /// once the tenant leaves the registry.
    retired: RwLock<bool>,
}

impl Tenant {
    fn new(id: &str, config: TenantConfig, now: Instant) -> Self {
        let processors = config
            .processors
            .iter()
            .map(|kind| Processor::new(*kind, &config))
            .collect();
        let next_flush = now + config.flush_interval;
        Tenant {
            id: id.to_string(),
            config,
            processors,
            last_activity: Mutex::new(now),
            next_flush: Mutex::new(next_flush),
            retired: RwLock::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    #[must_use]
    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    /// Hands `span` to every processor. Returns `false`, without touching
    /// any state, once the tenant has been retired.
    #[must_use]
    pub fn push_span(&self, span: &Span, now: Instant) -> bool {
        let retired = self.retired.read().unwrap_or_else(PoisonError::into_inner);
        if *retired {
            return false;
        }
        {
            let mut last = lock(&self.last_activity);
            if now > *last {
                *last = now;
            }
        }
        for processor in &self.processors {
            processor.push_span(span, now);
        }
        true
    }

    /// Collects every processor into one batch and resets them.
    #[must_use]
    pub fn collect(&self, timestamp_ms: i64) -> ExportBatch {
        let samples = self
            .processors
            .iter()
            .flat_map(|p| p.collect(timestamp_ms))
            .collect();
        ExportBatch::new(self.id.clone(), samples)
    }

    fn flush_if_due(&self, now: Instant, timestamp_ms: i64) -> Option<ExportBatch> {
        {
            let mut next = lock(&self.next_flush);
            if now < *next {
                return None;
            }
            *next = now + self.config.flush_interval;
        }
        Some(self.collect(timestamp_ms))
    }

    pub fn expire(&self, now: Instant) -> usize {
        self.processors.iter().map(|p| p.expire(now)).sum()
    }

    /// Evicts all pending state and counts it as unpaired.
    pub fn expire_all(&self) -> usize {
        self.processors.iter().map(Processor::expire_all).sum()
    }

    #[must_use]
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(*lock(&self.last_activity)) > idle_timeout
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        *self.retired.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retires the tenant if it is idle. Waits for in-flight pushes, so
    /// nothing reaches the processors after this returns `true`.
    fn retire_if_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        let mut retired = self.retired.write().unwrap_or_else(PoisonError::into_inner);
        if !*retired && self.is_idle(now, idle_timeout) {
            *retired = true;
        }
        *retired
    }

    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        let mut stats = ProcessorStats::default();
        for p in &self.processors {
            stats += p.stats();
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_tenants: usize,
    pub tenants_created: u64,
    pub tenants_removed: u64,
    pub tenant_limit_rejections: u64,
    pub malformed_spans: u64,
    pub spans_dispatched: u64,
    /// Summed over live tenants only.
    pub processors: ProcessorStats,
}

pub struct TenantRegistry {
    config: Arc<Config>,
    tenants: RwLock<HashMap<String, Arc<Tenant>>>,
    tenants_created: AtomicU64,
    tenants_removed: AtomicU64,
    tenant_limit_rejections: AtomicU64,
    malformed_spans: AtomicU64,
    spans_dispatched: AtomicU64,
}

impl TenantRegistry {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        TenantRegistry {
            config,
            tenants: RwLock::new(HashMap::new()),
            tenants_created: AtomicU64::new(0),
            tenants_removed: AtomicU64::new(0),
            tenant_limit_rejections: AtomicU64::new(0),
            malformed_spans: AtomicU64::new(0),
            spans_dispatched: AtomicU64::new(0),
        }
    }

    pub fn dispatch(&self, tenant: &str, span: &Span) -> Result<(), DispatchError> {
        self.dispatch_at(tenant, span, Instant::now())
    }

    /// Validates `span` and hands it to every processor of `tenant`,
    /// creating the tenant if needed. A rejected span is counted and does
    /// not affect any other span.
    pub fn dispatch_at(&self, tenant: &str, span: &Span, now: Instant) -> Result<(), DispatchError> {
        if let Err(e) = span.validate() {
            self.malformed_spans.fetch_add(1, Ordering::Relaxed);
            debug!("Rejecting span for tenant {tenant}: {e}");
            return Err(e.into());
        }
        // A sweep can retire the tenant between lookup and push; the next
        // lookup then creates a fresh one.
        while !self.get_or_create(tenant, now)?.push_span(span, now) {
            debug!("Tenant {tenant} was retired during dispatch, retrying");
        }
        self.spans_dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the tenant, creating it at most once even when several
    /// callers race on its first span.
    pub fn get_or_create(&self, tenant: &str, now: Instant) -> Result<Arc<Tenant>, DispatchError> {
        if tenant.is_empty() {
            return Err(DispatchError::EmptyTenant);
        }
        if let Some(existing) = self.read().get(tenant) {
            return Ok(Arc::clone(existing));
        }

        let mut tenants = self.write();
        if let Some(existing) = tenants.get(tenant) {
            return Ok(Arc::clone(existing));
        }
        let max = self.config.registry.max_tenants;
        if tenants.len() >= max {
            drop(tenants);
            let rejected = self.tenant_limit_rejections.fetch_add(1, Ordering::Relaxed) + 1;
            if rejected == 1 || rejected % 1_000 == 0 {
                warn!("Tenant limit of {max} reached, rejected tenant {tenant} ({rejected} rejections so far)");
            }
            return Err(DispatchError::TenantLimit(max));
        }

        let created = Arc::new(Tenant::new(tenant, self.config.tenant(tenant), now));
        tenants.insert(tenant.to_string(), Arc::clone(&created));
        drop(tenants);

        self.tenants_created.fetch_add(1, Ordering::Relaxed);
        info!(
            "Created tenant {tenant} with processors {:?}",
            created
                .config()
                .processors
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
        );
        Ok(created)
    }

    #[must_use]
    pub fn get(&self, tenant: &str) -> Option<Arc<Tenant>> {
        self.read().get(tenant).cloned()
    }

    #[must_use]
    pub fn tenant_count(&self) -> usize {
        self.read().len()
    }

    /// Flushes every tenant whose flush deadline has passed. Empty batches
    /// are not returned.
    pub fn flush_due(&self, now: Instant, timestamp_ms: i64) -> Vec<ExportBatch> {
        self.tenants()
            .iter()
            .filter_map(|t| t.flush_if_due(now, timestamp_ms))
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// Flushes every tenant regardless of its deadline.
    pub fn flush_all(&self, timestamp_ms: i64) -> Vec<ExportBatch> {
        self.tenants()
            .iter()
            .map(|t| t.collect(timestamp_ms))
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// Runs the pending-edge expiry of every tenant.
    pub fn expire(&self, now: Instant) -> usize {
        self.tenants().iter().map(|t| t.expire(now)).sum()
    }

    /// Removes tenants idle for longer than the idle timeout and returns
    /// their final batches. Pending edges of a removed tenant are counted
    /// as unpaired whatever their age.
    pub fn sweep(&self, now: Instant, timestamp_ms: i64) -> Vec<ExportBatch> {
        let idle_timeout = self.config.registry.idle_timeout();
        let removed: Vec<Arc<Tenant>> = {
            let mut tenants = self.write();
            let idle: Vec<String> = tenants
                .iter()
                .filter(|(_, t)| t.retire_if_idle(now, idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            idle.iter().filter_map(|id| tenants.remove(id)).collect()
        };
        if removed.is_empty() {
            return Vec::new();
        }

        self.tenants_removed
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
            .iter()
            .filter_map(|t| {
                info!("Removing idle tenant {}", t.id());
                t.expire_all();
                let batch = t.collect(timestamp_ms);
                (!batch.is_empty()).then_some(batch)
            })
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let tenants = self.tenants();
        let mut processors = ProcessorStats::default();
        for t in &tenants {
            processors += t.stats();
        }
        RegistryStats {
            active_tenants: tenants.len(),
            tenants_created: self.tenants_created.load(Ordering::Relaxed),
            tenants_removed: self.tenants_removed.load(Ordering::Relaxed),
            tenant_limit_rejections: self.tenant_limit_rejections.load(Ordering::Relaxed),
            malformed_spans: self.malformed_spans.load(Ordering::Relaxed),
            spans_dispatched: self.spans_dispatched.load(Ordering::Relaxed),
            processors,
        }
    }

    /// Snapshot of the live tenants, so per-tenant work runs without the
    /// registry lock.
    fn tenants(&self) -> Vec<Arc<Tenant>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Tenant>>> {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Tenant>>> {
        self.tenants.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantOverrides;
    use crate::processor::service_graphs::UNPAIRED_SPANS_TOTAL;
    use crate::processor::span_metrics::CALLS_TOTAL;
    use crate::processor::ProcessorKind;
    use crate::span::test_util::span;
    use crate::span::{SpanKind, Status};

    fn registry(config: Config) -> TenantRegistry {
        TenantRegistry::new(Arc::new(config))
    }

    fn ok_span() -> Span {
        span("api", SpanKind::Server, 1, 2, Some(1), 10, Status::Ok)
    }

    #[test]
    fn test_dispatch_creates_tenant_once() {
        let registry = Arc::new(registry(Config::default()));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.dispatch_at("t1", &ok_span(), now).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.tenants_created, 1);
        assert_eq!(stats.spans_dispatched, 8);
        let batch = registry.flush_all(0).pop().unwrap();
        assert_eq!(
            batch.find(CALLS_TOTAL, &[]).and_then(|s| s.as_counter()),
            Some(8.0)
        );
    }

    #[test]
    fn test_malformed_span_is_counted_and_skipped() {
        let registry = registry(Config::default());
        let mut bad = ok_span();
        bad.trace_id.clear();
        assert!(matches!(
            registry.dispatch("t1", &bad),
            Err(DispatchError::Malformed(IngestError::MissingTraceId))
        ));
        registry.dispatch("t1", &ok_span()).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.malformed_spans, 1);
        assert_eq!(stats.spans_dispatched, 1);
    }

    #[test]
    fn test_tenant_limit_rejects_new_tenants() {
        let mut config = Config::default();
        config.registry.max_tenants = 1;
        let registry = registry(config);

        registry.dispatch("t1", &ok_span()).unwrap();
        assert!(matches!(
            registry.dispatch("t2", &ok_span()),
            Err(DispatchError::TenantLimit(1))
        ));
        // Existing tenants keep working.
        registry.dispatch("t1", &ok_span()).unwrap();
        assert_eq!(registry.stats().tenant_limit_rejections, 1);
        assert_eq!(registry.tenant_count(), 1);
    }

    #[test]
    fn test_empty_tenant_is_rejected() {
        let registry = registry(Config::default());
        assert!(matches!(
            registry.dispatch("", &ok_span()),
            Err(DispatchError::EmptyTenant)
        ));
    }

    #[test]
    fn test_flush_due_honors_per_tenant_interval() {
        let mut config = Config::default();
        config.registry.flush_interval_secs = 10;
        config.overrides.insert(
            "fast".to_string(),
            TenantOverrides {
                flush_interval_secs: Some(2),
                ..Default::default()
            },
        );
        let registry = registry(config);
        let start = Instant::now();
        registry.dispatch_at("fast", &ok_span(), start).unwrap();
        registry.dispatch_at("slow", &ok_span(), start).unwrap();

        assert!(registry.flush_due(start + Duration::from_secs(1), 0).is_empty());

        let due = registry.flush_due(start + Duration::from_secs(3), 0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].tenant, "fast");

        let due = registry.flush_due(start + Duration::from_secs(11), 0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].tenant, "slow");
    }

    #[test]
    fn test_overrides_select_processors() {
        let mut config = Config::default();
        config.overrides.insert(
            "graphs-only".to_string(),
            TenantOverrides {
                processors: Some(vec![ProcessorKind::ServiceGraphs]),
                ..Default::default()
            },
        );
        let registry = registry(config);
        let tenant = registry.get_or_create("graphs-only", Instant::now()).unwrap();
        let kinds: Vec<_> = tenant.processors().iter().map(Processor::kind).collect();
        assert_eq!(kinds, vec![ProcessorKind::ServiceGraphs]);
    }

    #[test]
    fn test_sweep_removes_idle_tenants_after_flushing() {
        let mut config = Config::default();
        config.registry.idle_timeout_secs = 60;
        let registry = registry(config);
        let start = Instant::now();
        registry.dispatch_at("idle", &ok_span(), start).unwrap();
        registry
            .dispatch_at("busy", &ok_span(), start + Duration::from_secs(50))
            .unwrap();

        let batches = registry.sweep(start + Duration::from_secs(61), 42);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].tenant, "idle");
        assert!(batches[0].samples.iter().all(|s| s.timestamp_ms == 42));

        assert!(registry.get("idle").is_none());
        assert!(registry.get("busy").is_some());
        assert_eq!(registry.stats().tenants_removed, 1);

        // A removed tenant is recreated from scratch on its next span.
        registry
            .dispatch_at("idle", &ok_span(), start + Duration::from_secs(62))
            .unwrap();
        assert_eq!(registry.stats().tenants_created, 3);
    }

    #[test]
    fn test_expire_reaches_every_tenant() {
        let registry = registry(Config::default());
        let start = Instant::now();
        let client = span("a", SpanKind::Client, 1, 2, None, 10, Status::Ok);
        registry.dispatch_at("t1", &client, start).unwrap();
        registry.dispatch_at("t2", &client, start).unwrap();
        assert_eq!(registry.expire(start + Duration::from_secs(60)), 2);
        assert_eq!(registry.stats().processors.expired_edges, 2);
    }

    #[test]
    fn test_span_for_swept_tenant_lands_in_fresh_tenant() {
        let mut config = Config::default();
        config.registry.idle_timeout_secs = 60;
        let registry = registry(config);
        let start = Instant::now();
        registry.dispatch_at("t1", &ok_span(), start).unwrap();

        // A dispatcher resolved the tenant just before the sweep ran.
        let stale = registry.get_or_create("t1", start).unwrap();
        let swept = registry.sweep(start + Duration::from_secs(61), 0);
        assert_eq!(swept.len(), 1);
        assert!(stale.is_retired());
        assert!(!stale.push_span(&ok_span(), start + Duration::from_secs(61)));

        registry
            .dispatch_at("t1", &ok_span(), start + Duration::from_secs(61))
            .unwrap();
        let fresh = registry.get("t1").unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(!fresh.is_retired());

        let batch = registry.flush_all(0).pop().unwrap();
        assert_eq!(
            batch.find(CALLS_TOTAL, &[]).and_then(|s| s.as_counter()),
            Some(1.0)
        );
        assert_eq!(registry.stats().spans_dispatched, 2);
    }

    #[test]
    fn test_dispatch_racing_sweep_loses_no_spans() {
        let mut config = Config::default();
        config.registry.idle_timeout_secs = 0;
        let registry = Arc::new(registry(config));
        let start = Instant::now();

        let dispatchers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        registry.dispatch_at("t1", &ok_span(), start).unwrap();
                    }
                })
            })
            .collect();
        let sweeper = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut batches = Vec::new();
                for _ in 0..200 {
                    batches.extend(registry.sweep(start + Duration::from_secs(1), 0));
                }
                batches
            })
        };
        for h in dispatchers {
            h.join().unwrap();
        }
        let mut batches = sweeper.join().unwrap();
        batches.extend(registry.flush_all(0));

        let calls: f64 = batches
            .iter()
            .filter_map(|b| b.find(CALLS_TOTAL, &[]).and_then(|s| s.as_counter()))
            .sum();
        assert_eq!(calls, 2_000.0);
    }

    #[test]
    fn test_sweep_counts_fresh_pending_edges_as_unpaired() {
        let mut config = Config::default();
        // Shorter than the service-graph wait, so the edge is still fresh.
        config.registry.idle_timeout_secs = 5;
        let registry = registry(config);
        let start = Instant::now();
        let client = span("a", SpanKind::Client, 1, 2, None, 10, Status::Ok);
        registry.dispatch_at("t1", &client, start).unwrap();

        let batch = registry
            .sweep(start + Duration::from_secs(6), 0)
            .pop()
            .unwrap();
        assert_eq!(
            batch
                .find(UNPAIRED_SPANS_TOTAL, &[("client", "a")])
                .and_then(|s| s.as_counter()),
            Some(1.0)
        );
    }
}
