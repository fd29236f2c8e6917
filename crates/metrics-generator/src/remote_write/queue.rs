// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::processor::lock;
use crate::sample::ExportBatch;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// FIFO of batches waiting for delivery. When full, the oldest batch is
/// evicted to make room; batches are never merged.
pub struct ExportQueue {
    batches: Mutex<VecDeque<ExportBatch>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl ExportQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        ExportQueue {
            batches: Mutex::new(VecDeque::with_capacity(capacity.min(128))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends `batch`, returning the batch it evicted, if any.
    pub fn push(&self, batch: ExportBatch) -> Option<ExportBatch> {
        let evicted = {
            let mut batches = lock(&self.batches);
            let evicted = if batches.len() >= self.capacity {
                batches.pop_front()
            } else {
                None
            };
            batches.push_back(batch);
            evicted
        };
        if let Some(old) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Export queue full ({} batches), dropping oldest batch of tenant {} with {} samples",
                self.capacity,
                old.tenant,
                old.len()
            );
        }
        evicted
    }

    /// Puts back a batch whose delivery was interrupted, ahead of newer
    /// ones. If the queue filled up meanwhile the batch is the oldest and
    /// is dropped instead; returns whether it was kept.
    pub fn requeue(&self, batch: ExportBatch) -> bool {
        {
            let mut batches = lock(&self.batches);
            if batches.len() < self.capacity {
                batches.push_front(batch);
                return true;
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Export queue full ({} batches), dropping interrupted batch of tenant {} with {} samples",
            self.capacity,
            batch.tenant,
            batch.len()
        );
        false
    }

    pub fn pop(&self) -> Option<ExportBatch> {
        lock(&self.batches).pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.batches).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
