// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote-write export path.
//!
//! ```text
//!   Tenant flush
//!       │ ExportBatch
//!       v
//!   ┌─────────────┐
//!   │ ExportQueue │ (bounded, drops oldest)
//!   └──────┬──────┘
//!          │ every flush_interval
//!          v
//!   ┌─────────────┐
//!   │   Encode    │ (protobuf + snappy)
//!   └──────┬──────┘
//!          v
//!   ┌─────────────┐
//!   │ HTTP POST   │ (retry 429/5xx/network)
//!   └─────────────┘
//! ```
//!
//! Delivery is best effort: a batch that exhausts its retries or is
//! rejected is dropped and counted. A batch interrupted by shutdown goes
//! back to the front of the queue for the final flush.

pub mod client;
pub mod proto;
pub mod queue;

use crate::config::RemoteWriteConfig;
use crate::sample::ExportBatch;
use client::RemoteWriteClient;
use queue::ExportQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to build remote write request: {0}")]
    Build(String),

    #[error("failed to compress remote write payload: {0}")]
    Compress(#[from] snap::Error),

    #[error("remote write rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("remote write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("remote write cancelled during attempt {attempts}")]
    Cancelled { attempts: u32 },
}

impl ExportError {
    /// True for failures that were never retried.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExportError::Build(_) | ExportError::Compress(_) | ExportError::Rejected { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub queued: usize,
    pub batches_enqueued: u64,
    pub batches_dropped: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub batches_rejected: u64,
    pub batches_discarded: u64,
    pub samples_sent: u64,
}

pub struct RemoteWriteExporter {
    config: RemoteWriteConfig,
    queue: ExportQueue,
    /// `None` when remote write is disabled.
    client: Option<RemoteWriteClient>,
    batches_enqueued: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    batches_rejected: AtomicU64,
    batches_discarded: AtomicU64,
    samples_sent: AtomicU64,
}

impl RemoteWriteExporter {
    pub fn new(config: RemoteWriteConfig) -> Result<Self, ExportError> {
        let client = if config.enabled {
            Some(RemoteWriteClient::new(&config)?)
        } else {
            None
        };
        Ok(RemoteWriteExporter {
            queue: ExportQueue::new(config.queue_capacity.max(1)),
            config,
            client,
            batches_enqueued: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
            batches_discarded: AtomicU64::new(0),
            samples_sent: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Queues `batch` for the next flush. Empty batches are ignored; with
    /// remote write disabled the batch is discarded.
    pub fn enqueue(&self, batch: ExportBatch) {
        if batch.is_empty() {
            return;
        }
        if self.client.is_none() {
            self.batches_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.batches_enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue.push(batch);
    }

    /// Sends every queued batch, one request per batch. Returns the number
    /// of batches delivered.
    pub async fn flush(&self) -> usize {
        self.flush_until(&CancellationToken::new()).await
    }

    /// Like [`flush`](Self::flush), but stops once `cancel` fires. The batch
    /// in flight at that point is requeued.
    pub async fn flush_until(&self, cancel: &CancellationToken) -> usize {
        let Some(client) = &self.client else {
            return 0;
        };

        let mut sent = 0;
        while !cancel.is_cancelled() {
            let Some(batch) = self.queue.pop() else {
                break;
            };
            match client.push(&batch, cancel).await {
                Ok(()) => {
                    sent += 1;
                    self.batches_sent.fetch_add(1, Ordering::Relaxed);
                    self.samples_sent
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err(ExportError::Cancelled { .. }) => {
                    debug!(
                        "Remote write for tenant {} interrupted, requeueing batch",
                        batch.tenant
                    );
                    self.queue.requeue(batch);
                    break;
                }
                Err(e) if e.is_permanent() => {
                    self.batches_rejected.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Dropping batch of {} samples for tenant {}: {e}",
                        batch.len(),
                        batch.tenant
                    );
                }
                Err(e) => {
                    self.batches_failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Dropping batch of {} samples for tenant {}: {e}",
                        batch.len(),
                        batch.tenant
                    );
                }
            }
        }
        if sent > 0 {
            debug!("Remote write flushed {sent} batches");
        }
        sent
    }

    /// Flushes every `flush_interval` until cancelled. The final flush on
    /// shutdown is left to the owner.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.client.is_none() {
            debug!("Remote write disabled, exporter loop not started");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Remote write loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_until(&cancel).await;
                }
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> ExporterStats {
        ExporterStats {
            queued: self.queue.len(),
            batches_enqueued: self.batches_enqueued.load(Ordering::Relaxed),
            batches_dropped: self.queue.dropped(),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_discarded: self.batches_discarded.load(Ordering::Relaxed),
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Labels, MetricSample};

    fn batch(tenant: &str) -> ExportBatch {
        ExportBatch::new(
            tenant,
            vec![MetricSample::counter("calls_total", Labels::default(), 0, 1.0)],
        )
    }

    fn enabled(queue_capacity: usize) -> RemoteWriteConfig {
        RemoteWriteConfig {
            enabled: true,
            endpoint: "http://127.0.0.1:1/api/v1/write".to_string(),
            queue_capacity,
            ..Default::default()
        }
    }

    #[test]
    fn test_bounded_queue_drops_oldest_batch() {
        let exporter = RemoteWriteExporter::new(enabled(3)).unwrap();
        for i in 0..4 {
            exporter.enqueue(batch(&format!("t{i}")));
        }
        let stats = exporter.stats();
        assert_eq!(stats.batches_enqueued, 4);
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.queued, 3);
    }

    #[tokio::test]
    async fn test_disabled_exporter_discards() {
        let exporter = RemoteWriteExporter::new(RemoteWriteConfig::default()).unwrap();
        assert!(!exporter.is_enabled());
        exporter.enqueue(batch("t1"));
        exporter.enqueue(ExportBatch::new("t1", Vec::new()));
        assert_eq!(exporter.flush().await, 0);

        let stats = exporter.stats();
        assert_eq!(stats.batches_discarded, 1);
        assert_eq!(stats.queued, 0);
    }

    #[test]
    fn test_permanent_classification() {
        assert!(ExportError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_permanent());
        assert!(!ExportError::RetriesExhausted {
            attempts: 3,
            last: String::new()
        }
        .is_permanent());
        assert!(!ExportError::Cancelled { attempts: 1 }.is_permanent());
    }

    #[tokio::test]
    async fn test_cancelled_flush_keeps_queue() {
        let exporter = RemoteWriteExporter::new(enabled(4)).unwrap();
        exporter.enqueue(batch("t1"));
        exporter.enqueue(batch("t2"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(exporter.flush_until(&cancel).await, 0);
        let stats = exporter.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(stats.batches_rejected, 0);
    }
}
