// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generator orchestration.
//!
//! [`Generator`] owns the ring client, the lifecycler, the tenant registry and
//! the exporter, and runs their background loops:
//!
//! | loop            | period                          | work                                  |
//! |-----------------|---------------------------------|---------------------------------------|
//! | ring refresh    | store change / `refresh_period` | reload the ring snapshot              |
//! | heartbeat       | `heartbeat_period`              | publish the instance descriptor       |
//! | flush scheduler | `flush_check_period`            | flush tenants whose interval elapsed  |
//! | sweep           | `sweep_period`                  | expire pending edges, drop idle tenants |
//! | exporter        | `remote_write.flush_interval`   | push queued batches                   |
//!
//! All loops stop on the generator's [`CancellationToken`].

use crate::config::Config;
use crate::error::GeneratorError;
use crate::processor::lock;
use crate::registry::{RegistryStats, TenantRegistry};
use crate::remote_write::{ExporterStats, RemoteWriteExporter};
use crate::ring::kv::MembershipStore;
use crate::ring::lifecycler::Lifecycler;
use crate::ring::{token_for, InstanceState, Ring};
use crate::span::Span;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to the spans of one [`Generator::push_spans`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub accepted: usize,
    /// Owned by other instances per the local ring view.
    pub not_owned: usize,
    /// Malformed or refused by the registry.
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorStats {
    pub instance_id: String,
    pub state: InstanceState,
    pub spans_received: u64,
    pub spans_not_owned: u64,
    pub spans_rejected: u64,
    pub heartbeats: u64,
    pub heartbeat_failures: u64,
    pub token_conflicts: u64,
    pub ring_refresh_failures: u64,
    pub registry: RegistryStats,
    pub exporter: ExporterStats,
}

pub struct Generator {
    config: Arc<Config>,
    ring: Arc<Ring>,
    lifecycler: Arc<Lifecycler>,
    registry: Arc<TenantRegistry>,
    exporter: Arc<RemoteWriteExporter>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    spans_received: AtomicU64,
    spans_not_owned: AtomicU64,
    spans_rejected: AtomicU64,
}

impl Generator {
    pub fn new(config: Config, store: Arc<dyn MembershipStore>) -> Result<Self, GeneratorError> {
        config.validate()?;
        let config = Arc::new(config);
        let ring = Arc::new(Ring::new(store, config.lifecycler.ring.clone()));
        let lifecycler = Arc::new(Lifecycler::new(
            Arc::clone(&ring),
            config.lifecycler.clone(),
        ));
        let registry = Arc::new(TenantRegistry::new(Arc::clone(&config)));
        let exporter = Arc::new(RemoteWriteExporter::new(config.remote_write.clone())?);

        Ok(Generator {
            config,
            ring,
            lifecycler,
            registry,
            exporter,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            spans_received: AtomicU64::new(0),
            spans_not_owned: AtomicU64::new(0),
            spans_rejected: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.lifecycler.id()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    #[must_use]
    pub fn lifecycler(&self) -> &Arc<Lifecycler> {
        &self.lifecycler
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn exporter(&self) -> &Arc<RemoteWriteExporter> {
        &self.exporter
    }

    /// Joins the ring and starts every background loop.
    pub async fn start(&self) -> Result<(), GeneratorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GeneratorError::AlreadyStarted);
        }
        self.lifecycler.start().await?;

        let mut tasks = Vec::with_capacity(5);

        let ring = Arc::clone(&self.ring);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { ring.run(cancel).await }));

        let lifecycler = Arc::clone(&self.lifecycler);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { lifecycler.run(cancel).await }));

        tasks.push(tokio::spawn(flush_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.exporter),
            self.config.registry.flush_check_period(),
            self.cancel.clone(),
        )));

        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.exporter),
            self.config.registry.sweep_period(),
            self.cancel.clone(),
        )));

        let exporter = Arc::clone(&self.exporter);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { exporter.run(cancel).await }));

        lock(&self.tasks).extend(tasks);
        info!(
            "Generator {} started (remote write {})",
            self.id(),
            if self.exporter.is_enabled() { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Keeps the spans this instance owns and dispatches them to the
    /// tenant's processors. Spans are sharded by `(tenant, trace id)`.
    pub fn push_spans(&self, tenant: &str, spans: &[Span]) -> Result<PushSummary, GeneratorError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(GeneratorError::ShuttingDown);
        }

        let replication_factor = self.replication_factor(tenant);
        let now = Instant::now();
        let mut summary = PushSummary::default();
        for span in spans {
            // Spans without a trace id cannot be placed; the registry
            // rejects and counts them.
            if !span.trace_id.is_empty() {
                let owners = self
                    .ring
                    .lookup_with_replication(token_for(tenant, &span.trace_id), replication_factor);
                if !owners.iter().any(|owner| owner == self.id()) {
                    summary.not_owned += 1;
                    continue;
                }
            }
            match self.registry.dispatch_at(tenant, span, now) {
                Ok(()) => summary.accepted += 1,
                Err(e) => {
                    debug!("Span rejected for tenant {tenant}: {e}");
                    summary.rejected += 1;
                }
            }
        }

        self.spans_received
            .fetch_add(spans.len() as u64, Ordering::Relaxed);
        self.spans_not_owned
            .fetch_add(summary.not_owned as u64, Ordering::Relaxed);
        self.spans_rejected
            .fetch_add(summary.rejected as u64, Ordering::Relaxed);
        Ok(summary)
    }

    /// Flushes every tenant now and pushes the queue. Returns the number of
    /// batches delivered.
    pub async fn flush(&self) -> usize {
        for batch in self.registry.flush_all(crate::now_unix_millis()) {
            self.exporter.enqueue(batch);
        }
        self.exporter.flush().await
    }

    /// Removes an instance that is LEAVING or has stopped heartbeating from
    /// the ring.
    pub async fn forget(&self, id: &str) -> Result<(), GeneratorError> {
        self.ring.forget(id).await?;
        Ok(())
    }

    /// Stops the loops, leaves the ring and makes a final best-effort flush.
    /// Each of the three steps is bounded by the shutdown grace period.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), GeneratorError> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Generator {} shutting down", self.id());
        self.cancel.cancel();

        let grace = self.config.lifecycler.shutdown_grace_period();
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        let joined = tokio::time::timeout(grace, async {
            for task in &mut tasks {
                if let Err(e) = task.await {
                    error!("Background task failed: {e}");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!(
                "Background tasks did not stop within {} s, aborting them",
                grace.as_secs()
            );
            for task in &tasks {
                task.abort();
            }
        }

        let leave_result = if self.started.load(Ordering::SeqCst) {
            match tokio::time::timeout(grace, self.lifecycler.shutdown()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Leaving the ring did not complete within {} s",
                        grace.as_secs()
                    );
                    Ok(())
                }
            }
        } else {
            Ok(())
        };
        if let Err(e) = &leave_result {
            error!("Failed to leave the ring cleanly: {e}");
        }

        match tokio::time::timeout(grace, self.flush()).await {
            Ok(sent) => info!("Final flush delivered {sent} batches"),
            Err(_) => warn!(
                "Final flush did not complete within {} s",
                grace.as_secs()
            ),
        }

        leave_result.map_err(GeneratorError::from)
    }

    #[must_use]
    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            instance_id: self.id().to_string(),
            state: self.lifecycler.state(),
            spans_received: self.spans_received.load(Ordering::Relaxed),
            spans_not_owned: self.spans_not_owned.load(Ordering::Relaxed),
            spans_rejected: self.spans_rejected.load(Ordering::Relaxed),
            heartbeats: self.lifecycler.heartbeats(),
            heartbeat_failures: self.lifecycler.heartbeat_failures(),
            token_conflicts: self.lifecycler.token_conflicts(),
            ring_refresh_failures: self.ring.refresh_failures(),
            registry: self.registry.stats(),
            exporter: self.exporter.stats(),
        }
    }

    fn replication_factor(&self, tenant: &str) -> usize {
        self.config
            .overrides
            .get(tenant)
            .and_then(|o| o.replication_factor)
            .unwrap_or(self.config.lifecycler.ring.replication_factor)
    }
}

async fn flush_loop(
    registry: Arc<TenantRegistry>,
    exporter: Arc<RemoteWriteExporter>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Flush scheduler shutting down");
                break;
            }
            _ = ticker.tick() => {
                let batches = registry.flush_due(Instant::now(), crate::now_unix_millis());
                if !batches.is_empty() {
                    debug!("Flushed {} tenants", batches.len());
                }
                for batch in batches {
                    exporter.enqueue(batch);
                }
            }
        }
    }
}

async fn sweep_loop(
    registry: Arc<TenantRegistry>,
    exporter: Arc<RemoteWriteExporter>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Sweep loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                registry.expire(now);
                for batch in registry.sweep(now, crate::now_unix_millis()) {
                    exporter.enqueue(batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecyclerConfig, TenantOverrides};
    use crate::processor::service_graphs::REQUEST_TOTAL;
    use crate::ring::kv::InMemoryStore;
    use crate::span::test_util::span;
    use crate::span::{SpanKind, Status};

    fn config(id: &str) -> Config {
        Config {
            lifecycler: LifecyclerConfig {
                id: id.to_string(),
                num_tokens: 32,
                tokens_seed: Some(u64::from(id.as_bytes()[id.len() - 1])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn spans(count: u8) -> Vec<Span> {
        (0..count)
            .map(|trace| span("api", SpanKind::Server, trace, 2, Some(1), 5, Status::Ok))
            .collect()
    }

    #[tokio::test]
    async fn test_single_instance_owns_everything() {
        let store = Arc::new(InMemoryStore::new());
        let generator = Generator::new(config("gen-0"), store).unwrap();
        generator.start().await.unwrap();

        let client = span("A", SpanKind::Client, 9, 3, Some(1), 50, Status::Ok);
        let server = span("B", SpanKind::Server, 9, 4, Some(3), 48, Status::Ok);
        let summary = generator.push_spans("t1", &[client, server]).unwrap();
        assert_eq!(summary.accepted, 2);

        let batch = generator.registry().flush_all(0).pop().unwrap();
        assert_eq!(
            batch
                .find(REQUEST_TOTAL, &[("client", "A"), ("server", "B")])
                .and_then(|s| s.as_counter()),
            Some(1.0)
        );

        generator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_instances_split_ownership() {
        let store = Arc::new(InMemoryStore::new());
        let a = Generator::new(config("gen-1"), store.clone()).unwrap();
        let b = Generator::new(config("gen-2"), store.clone()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.ring().refresh().await.unwrap();
        b.ring().refresh().await.unwrap();

        let spans = spans(200);
        let from_a = a.push_spans("t1", &spans).unwrap();
        let from_b = b.push_spans("t1", &spans).unwrap();

        assert_eq!(from_a.accepted + from_b.accepted, 200);
        assert_eq!(from_a.not_owned, from_b.accepted);
        assert!(from_a.accepted > 0 && from_b.accepted > 0);

        // Replicated to every instance, each one keeps every span.
        let mut cfg = config("gen-3");
        cfg.overrides.insert(
            "t2".to_string(),
            TenantOverrides {
                replication_factor: Some(3),
                ..Default::default()
            },
        );
        let c = Generator::new(cfg, store.clone()).unwrap();
        c.start().await.unwrap();
        assert_eq!(c.push_spans("t2", &spans).unwrap().accepted, 200);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        c.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_spans_are_counted() {
        let store = Arc::new(InMemoryStore::new());
        let generator = Generator::new(config("gen-0"), store).unwrap();
        generator.start().await.unwrap();

        let mut no_trace = spans(1).remove(0);
        no_trace.trace_id.clear();
        let mut no_service = spans(1).remove(0);
        no_service.service_name.clear();

        let summary = generator
            .push_spans("t1", &[no_trace, no_service, spans(1).remove(0)])
            .unwrap();
        assert_eq!(
            summary,
            PushSummary {
                accepted: 1,
                not_owned: 0,
                rejected: 2
            }
        );
        let stats = generator.stats();
        assert_eq!(stats.spans_received, 3);
        assert_eq!(stats.spans_rejected, 2);
        assert_eq!(stats.registry.malformed_spans, 2);

        generator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let store = Arc::new(InMemoryStore::new());
        let generator = Generator::new(config("gen-0"), store).unwrap();
        generator.start().await.unwrap();
        assert!(matches!(
            generator.start().await,
            Err(GeneratorError::AlreadyStarted)
        ));
        generator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_ring_and_refuses_spans() {
        let store = Arc::new(InMemoryStore::new());
        let generator = Generator::new(config("gen-0"), store.clone()).unwrap();
        generator.start().await.unwrap();
        generator.shutdown().await.unwrap();

        assert_eq!(generator.stats().state, InstanceState::Left);
        assert!(store.get("generator/gen-0").await.unwrap().is_none());
        assert!(matches!(
            generator.push_spans("t1", &spans(1)),
            Err(GeneratorError::ShuttingDown)
        ));
        // Second shutdown is a no-op.
        generator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut cfg = config("gen-0");
        cfg.lifecycler.ring.replication_factor = 0;
        assert!(matches!(
            Generator::new(cfg, Arc::new(InMemoryStore::new())),
            Err(GeneratorError::Config(_))
        ));
    }
}
