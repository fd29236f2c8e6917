// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consistent-hashing membership ring.
//!
//! Every instance publishes an [`InstanceDesc`] under `{ring_key}/{id}` in the
//! shared [`kv::MembershipStore`]. [`Ring`] keeps a local, immutable
//! [`RingSnapshot`] of all descriptors and swaps it atomically on refresh, so
//! lookups never wait on the store.
//!
//! A lookup walks the sorted token list clockwise from the key and collects
//! distinct healthy instances until the replication factor is reached. An
//! instance is healthy when it is `ACTIVE` and its last heartbeat is within
//! the heartbeat timeout. Unhealthy instances keep their tokens in the store,
//! but those tokens are skipped, so their keys fall through to the next
//! healthy owner.

pub mod kv;
pub mod lifecycler;
pub mod tokens;

use crate::config::RingConfig;
use arc_swap::ArcSwap;
use kv::{MembershipStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use tokens::token_for;

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode instance descriptor: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("instance {0} is not in the ring")]
    InstanceNotFound(String),

    #[error("instance {0} is active and healthy, refusing to forget it")]
    InstanceHealthy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Joining,
    Active,
    Leaving,
    Left,
}

impl InstanceState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Joining => "JOINING",
            InstanceState::Active => "ACTIVE",
            InstanceState::Leaving => "LEAVING",
            InstanceState::Left => "LEFT",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance as published in the membership store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    pub state: InstanceState,
    /// Sorted.
    pub tokens: Vec<u32>,
    /// Unix milliseconds of the last heartbeat.
    pub heartbeat_ms: i64,
    pub registered_at_ms: i64,
}

impl InstanceDesc {
    #[must_use]
    pub fn is_healthy(&self, now_ms: i64, heartbeat_timeout: Duration) -> bool {
        let timeout_ms = i64::try_from(heartbeat_timeout.as_millis()).unwrap_or(i64::MAX);
        self.state == InstanceState::Active
            && now_ms.saturating_sub(self.heartbeat_ms) <= timeout_ms
    }
}

/// Immutable view of the ring at one store version.
#[derive(Debug, Default)]
pub struct RingSnapshot {
    version: u64,
    /// Sorted by id.
    instances: Vec<InstanceDesc>,
    /// `(token, index into instances)`, sorted.
    tokens: Vec<(u32, usize)>,
}

impl RingSnapshot {
    #[must_use]
    pub fn new(version: u64, mut instances: Vec<InstanceDesc>) -> Self {
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances.dedup_by(|a, b| a.id == b.id);
        let mut tokens: Vec<(u32, usize)> = instances
            .iter()
            .enumerate()
            .flat_map(|(idx, desc)| desc.tokens.iter().map(move |t| (*t, idx)))
            .collect();
        tokens.sort_unstable();
        RingSnapshot {
            version,
            instances,
            tokens,
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn instances(&self) -> &[InstanceDesc] {
        &self.instances
    }

    #[must_use]
    pub fn instance(&self, id: &str) -> Option<&InstanceDesc> {
        self.instances
            .binary_search_by(|d| d.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.instances[i])
    }

    #[must_use]
    pub fn healthy_count(&self, now_ms: i64, heartbeat_timeout: Duration) -> usize {
        self.instances
            .iter()
            .filter(|d| d.is_healthy(now_ms, heartbeat_timeout))
            .count()
    }

    /// Up to `replication_factor` distinct healthy instance ids responsible
    /// for `key`, in clockwise order starting at the first token `>= key`.
    #[must_use]
    pub fn lookup(
        &self,
        key: u32,
        replication_factor: usize,
        now_ms: i64,
        heartbeat_timeout: Duration,
    ) -> Vec<String> {
        let mut owners = Vec::with_capacity(replication_factor);
        if self.tokens.is_empty() || replication_factor == 0 {
            return owners;
        }

        let start = self.tokens.partition_point(|(t, _)| *t < key);
        let mut seen = vec![false; self.instances.len()];
        for i in 0..self.tokens.len() {
            let (_, idx) = self.tokens[(start + i) % self.tokens.len()];
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            let desc = &self.instances[idx];
            if desc.is_healthy(now_ms, heartbeat_timeout) {
                owners.push(desc.id.clone());
                if owners.len() == replication_factor {
                    break;
                }
            }
        }
        owners
    }

    /// Tokens of `id` also claimed by an instance whose id sorts first.
    /// The instance with the larger id yields.
    #[must_use]
    pub fn conflicting_tokens(&self, id: &str) -> Vec<u32> {
        let Some(own) = self.instances.iter().position(|d| d.id == id) else {
            return Vec::new();
        };
        self.tokens
            .windows(2)
            .filter(|w| w[0].0 == w[1].0)
            .filter_map(|w| {
                // Equal tokens are ordered by instance index, i.e. by id.
                let (winner, loser) = (w[0].1, w[1].1);
                (loser == own && winner != own).then_some(w[0].0)
            })
            .collect()
    }
}

/// Local client of the shared ring.
pub struct Ring {
    store: Arc<dyn MembershipStore>,
    config: RingConfig,
    snapshot: ArcSwap<RingSnapshot>,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

impl Ring {
    #[must_use]
    pub fn new(store: Arc<dyn MembershipStore>, config: RingConfig) -> Self {
        Ring {
            store,
            config,
            snapshot: ArcSwap::from_pointee(RingSnapshot::default()),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MembershipStore> {
        &self.store
    }

    /// Store key of instance `id`.
    #[must_use]
    pub fn instance_key(&self, id: &str) -> String {
        format!("{}/{id}", self.config.key)
    }

    fn prefix(&self) -> String {
        format!("{}/", self.config.key)
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot.load_full()
    }

    /// Reloads every descriptor from the store. On failure the previous
    /// snapshot stays in place.
    pub async fn refresh(&self) -> Result<(), RingError> {
        let version = *self.store.watch().borrow();
        let entries = match self.store.list(&self.prefix()).await {
            Ok(entries) => entries,
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let mut instances = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<InstanceDesc>(&value) {
                Ok(desc) => instances.push(desc),
                Err(e) => warn!("Skipping undecodable ring entry {key}: {e}"),
            }
        }

        let snapshot = RingSnapshot::new(version, instances);
        debug!(
            "Ring refreshed: version {}, {} instances, {} tokens",
            snapshot.version,
            snapshot.instances.len(),
            snapshot.tokens.len()
        );
        self.snapshot.store(Arc::new(snapshot));
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Owners of `key` at the configured replication factor.
    #[must_use]
    pub fn lookup(&self, key: u32) -> Vec<String> {
        self.lookup_with_replication(key, self.config.replication_factor)
    }

    #[must_use]
    pub fn lookup_with_replication(&self, key: u32, replication_factor: usize) -> Vec<String> {
        self.lookup_at(key, replication_factor, crate::now_unix_millis())
    }

    /// Lookup evaluated as of `now_ms`.
    #[must_use]
    pub fn lookup_at(&self, key: u32, replication_factor: usize, now_ms: i64) -> Vec<String> {
        self.snapshot.load().lookup(
            key,
            replication_factor,
            now_ms,
            self.config.heartbeat_timeout(),
        )
    }

    /// Removes the descriptor of an instance that is leaving or whose
    /// heartbeat has timed out. Healthy active instances cannot be forgotten.
    pub async fn forget(&self, id: &str) -> Result<(), RingError> {
        let key = self.instance_key(id);
        let Some(raw) = self.store.get(&key).await? else {
            return Err(RingError::InstanceNotFound(id.to_string()));
        };
        let desc: InstanceDesc = serde_json::from_slice(&raw)?;
        if desc.is_healthy(crate::now_unix_millis(), self.config.heartbeat_timeout()) {
            return Err(RingError::InstanceHealthy(id.to_string()));
        }
        self.store.delete(&key).await?;
        warn!("Forgot instance {id} (was {})", desc.state);
        // Failure to refresh only delays the local view.
        if let Err(e) = self.refresh().await {
            debug!("Ring refresh after forget failed: {e}");
        }
        Ok(())
    }

    /// Refreshes on every store change notification and at least once per
    /// refresh period, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut changes = self.store.watch();
        let mut watching = true;
        let mut ticker = tokio::time::interval(self.config.refresh_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Ring refresh loop shutting down");
                    break;
                }
                changed = changes.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.refresh().await {
                warn!("Ring refresh failed, keeping last known ring: {e}");
            }
        }
    }

    #[must_use]
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::{InstanceDesc, InstanceState};

    pub(crate) fn desc(id: &str, state: InstanceState, tokens: &[u32], heartbeat_ms: i64) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: format!("{id}:3200"),
            state,
            tokens: tokens.to_vec(),
            heartbeat_ms,
            registered_at_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::desc;
    use super::*;
    use crate::ring::kv::InMemoryStore;
    use crate::ring::tokens::generate_tokens;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const TIMEOUT: Duration = Duration::from_secs(300);
    const NOW: i64 = 1_000_000_000;

    fn three_instances() -> RingSnapshot {
        RingSnapshot::new(
            1,
            vec![
                desc("a", InstanceState::Active, &[100, 400], NOW),
                desc("b", InstanceState::Active, &[200, 500], NOW),
                desc("c", InstanceState::Active, &[300, 600], NOW),
            ],
        )
    }

    #[test]
    fn test_lookup_walks_clockwise() {
        let ring = three_instances();
        assert_eq!(ring.lookup(150, 1, NOW, TIMEOUT), vec!["b"]);
        assert_eq!(ring.lookup(200, 1, NOW, TIMEOUT), vec!["b"]);
        assert_eq!(ring.lookup(150, 2, NOW, TIMEOUT), vec!["b", "c"]);
        // Wraps past the highest token.
        assert_eq!(ring.lookup(700, 2, NOW, TIMEOUT), vec!["a", "b"]);
    }

    #[test]
    fn test_lookup_returns_fewer_when_ring_is_small() {
        let ring = three_instances();
        assert_eq!(ring.lookup(150, 5, NOW, TIMEOUT), vec!["b", "c", "a"]);
        assert!(RingSnapshot::default().lookup(1, 1, NOW, TIMEOUT).is_empty());
    }

    #[test]
    fn test_dead_instance_is_skipped() {
        let before = three_instances();
        assert_eq!(before.lookup(150, 1, NOW, TIMEOUT), vec!["b"]);

        let stale = NOW - i64::try_from(TIMEOUT.as_millis()).unwrap() - 1;
        let after = RingSnapshot::new(
            2,
            vec![
                desc("a", InstanceState::Active, &[100, 400], NOW),
                desc("b", InstanceState::Active, &[200, 500], stale),
                desc("c", InstanceState::Active, &[300, 600], NOW),
            ],
        );
        assert_eq!(after.lookup(150, 1, NOW, TIMEOUT), vec!["c"]);
        assert_eq!(after.healthy_count(NOW, TIMEOUT), 2);
    }

    #[test]
    fn test_non_active_states_are_skipped() {
        let ring = RingSnapshot::new(
            1,
            vec![
                desc("a", InstanceState::Joining, &[100], NOW),
                desc("b", InstanceState::Leaving, &[200], NOW),
                desc("c", InstanceState::Active, &[300], NOW),
            ],
        );
        assert_eq!(ring.lookup(0, 3, NOW, TIMEOUT), vec!["c"]);
    }

    #[test]
    fn test_conflicting_tokens_larger_id_yields() {
        let ring = RingSnapshot::new(
            1,
            vec![
                desc("b", InstanceState::Active, &[5, 10], NOW),
                desc("a", InstanceState::Active, &[10, 20], NOW),
            ],
        );
        assert_eq!(ring.conflicting_tokens("b"), vec![10]);
        assert!(ring.conflicting_tokens("a").is_empty());
    }

    proptest! {
        #[test]
        fn prop_lookup_returns_min_rf_live_distinct(
            live in 1usize..6,
            dead in 0usize..3,
            rf in 1usize..5,
            key in any::<u32>(),
        ) {
            let mut rng = fastrand::Rng::with_seed(7);
            let mut taken = HashSet::new();
            let mut instances = Vec::new();
            for i in 0..live + dead {
                let tokens = generate_tokens(&mut rng, 8, &taken);
                taken.extend(tokens.iter().copied());
                let heartbeat = if i < live { NOW } else { 0 };
                instances.push(desc(&format!("i{i}"), InstanceState::Active, &tokens, heartbeat));
            }
            let ring = RingSnapshot::new(1, instances);

            let owners = ring.lookup(key, rf, NOW, TIMEOUT);
            prop_assert_eq!(owners.len(), rf.min(live));
            let distinct: HashSet<_> = owners.iter().collect();
            prop_assert_eq!(distinct.len(), owners.len());
            prop_assert_eq!(owners, ring.lookup(key, rf, NOW, TIMEOUT));
        }
    }

    async fn publish(store: &InMemoryStore, d: &InstanceDesc) {
        store
            .put(&format!("generator/{}", d.id), serde_json::to_vec(d).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_last_known_ring() {
        let store = Arc::new(InMemoryStore::new());
        let ring = Ring::new(store.clone(), RingConfig::default());
        let now = crate::now_unix_millis();
        publish(&store, &desc("a", InstanceState::Active, &[100], now)).await;

        ring.refresh().await.unwrap();
        assert_eq!(ring.lookup(50), vec!["a"]);

        store.set_unreachable(true);
        assert!(matches!(
            ring.refresh().await,
            Err(RingError::Store(StoreError::Unreachable))
        ));
        assert_eq!(ring.refresh_failures(), 1);
        assert_eq!(ring.lookup(50), vec!["a"]);
    }

    #[tokio::test]
    async fn test_forget_only_unhealthy_or_leaving() {
        let store = Arc::new(InMemoryStore::new());
        let ring = Ring::new(store.clone(), RingConfig::default());
        let now = crate::now_unix_millis();
        publish(&store, &desc("a", InstanceState::Active, &[100], now)).await;
        publish(&store, &desc("b", InstanceState::Leaving, &[200], now)).await;

        assert!(matches!(
            ring.forget("a").await,
            Err(RingError::InstanceHealthy(_))
        ));
        assert!(matches!(
            ring.forget("zzz").await,
            Err(RingError::InstanceNotFound(_))
        ));

        ring.forget("b").await.unwrap();
        assert!(store.get("generator/b").await.unwrap().is_none());
        assert!(ring.snapshot().instance("b").is_none());
        assert!(ring.snapshot().instance("a").is_some());
    }

    #[tokio::test]
    async fn test_run_follows_store_changes() {
        let store = Arc::new(InMemoryStore::new());
        let ring = Arc::new(Ring::new(
            store.clone(),
            RingConfig {
                refresh_period_ms: 60_000,
                ..Default::default()
            },
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            async move { ring.run(cancel).await }
        });

        publish(&store, &desc("a", InstanceState::Active, &[100], crate::now_unix_millis())).await;
        for _ in 0..100 {
            if ring.snapshot().instance("a").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ring.snapshot().instance("a").is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
