// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-instance ring membership.
//!
//! ```text
//! start():    (none) ──► JOINING ──join_after──► ACTIVE
//! run():      ACTIVE ──heartbeat every period──► ACTIVE
//! shutdown(): ACTIVE ──► LEAVING ──unregister_on_shutdown──► LEFT (descriptor deleted)
//!                                └─otherwise: stays LEAVING until Ring::forget
//! ```
//!
//! The descriptor is only ever written by its own lifecycler. Store writes
//! happen on a clone of the descriptor; the local mutex is never held across
//! an `.await`.

use super::tokens::generate_tokens;
use super::{InstanceDesc, InstanceState, Ring, RingError};
use crate::config::LifecyclerConfig;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Lifecycler {
    ring: Arc<Ring>,
    config: LifecyclerConfig,
    desc: Mutex<InstanceDesc>,
    rng: Mutex<fastrand::Rng>,
    heartbeats: AtomicU64,
    heartbeat_failures: AtomicU64,
    token_conflicts: AtomicU64,
}

impl Lifecycler {
    #[must_use]
    pub fn new(ring: Arc<Ring>, config: LifecyclerConfig) -> Self {
        let rng = config
            .tokens_seed
            .map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);
        let desc = InstanceDesc {
            id: config.id.clone(),
            addr: config.addr.clone(),
            state: InstanceState::Joining,
            tokens: Vec::new(),
            heartbeat_ms: 0,
            registered_at_ms: 0,
        };
        Lifecycler {
            ring,
            config,
            desc: Mutex::new(desc),
            rng: Mutex::new(rng),
            heartbeats: AtomicU64::new(0),
            heartbeat_failures: AtomicU64::new(0),
            token_conflicts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.desc().state
    }

    #[must_use]
    pub fn tokens(&self) -> Vec<u32> {
        self.desc().tokens.clone()
    }

    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn token_conflicts(&self) -> u64 {
        self.token_conflicts.load(Ordering::Relaxed)
    }

    /// Registers tokens as JOINING, waits `join_after`, then turns ACTIVE.
    ///
    /// Tokens left in the store by a previous run of the same instance are
    /// reused so that a restart does not reshuffle ownership.
    pub async fn start(&self) -> Result<(), RingError> {
        self.ring.refresh().await?;

        let key = self.ring.instance_key(self.id());
        let previous = match self.ring.store().get(&key).await? {
            Some(raw) => serde_json::from_slice::<InstanceDesc>(&raw).ok(),
            None => None,
        };

        let tokens = match previous {
            Some(prev) if prev.tokens.len() == self.config.num_tokens => {
                info!(
                    "Reusing {} tokens from previous registration of {}",
                    prev.tokens.len(),
                    self.id()
                );
                prev.tokens
            }
            _ => {
                let taken = self.tokens_taken_by_others();
                let mut rng = self.rng();
                generate_tokens(&mut rng, self.config.num_tokens, &taken)
            }
        };

        let now = crate::now_unix_millis();
        let joining = self.update(|desc| {
            desc.state = InstanceState::Joining;
            desc.tokens = tokens;
            desc.heartbeat_ms = now;
            desc.registered_at_ms = now;
        });
        self.publish(&joining).await?;
        info!(
            "Instance {} joining ring {} with {} tokens",
            self.id(),
            self.ring.config().key,
            joining.tokens.len()
        );

        let join_after = self.config.join_after();
        if !join_after.is_zero() {
            tokio::time::sleep(join_after).await;
        }

        let active = self.update(|desc| {
            desc.state = InstanceState::Active;
            desc.heartbeat_ms = crate::now_unix_millis();
        });
        self.publish(&active).await?;
        info!("Instance {} is ACTIVE", self.id());

        if let Err(e) = self.ring.refresh().await {
            debug!("Ring refresh after join failed: {e}");
        }
        Ok(())
    }

    /// Publishes a fresh heartbeat, first giving up any token another
    /// instance with a smaller id also claims.
    pub async fn heartbeat(&self) -> Result<(), RingError> {
        let snapshot = self.ring.snapshot();
        let conflicts = snapshot.conflicting_tokens(self.id());
        if !conflicts.is_empty() {
            let mut taken: HashSet<u32> = snapshot
                .instances()
                .iter()
                .flat_map(|d| d.tokens.iter().copied())
                .collect();
            taken.extend(self.desc().tokens.iter().copied());
            let replacements = {
                let mut rng = self.rng();
                generate_tokens(&mut rng, conflicts.len(), &taken)
            };
            warn!(
                "Instance {} regenerating {} conflicting tokens",
                self.id(),
                conflicts.len()
            );
            self.token_conflicts
                .fetch_add(conflicts.len() as u64, Ordering::Relaxed);
            self.update(|desc| {
                desc.tokens.retain(|t| !conflicts.contains(t));
                desc.tokens.extend(replacements);
                desc.tokens.sort_unstable();
            });
        }

        let desc = self.update(|desc| desc.heartbeat_ms = crate::now_unix_millis());
        match self.publish(&desc).await {
            Ok(()) => {
                self.heartbeats.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Heartbeats every `heartbeat_period` until cancelled. Failures are
    /// logged and retried on the next period.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start() just published.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Heartbeat loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Heartbeat for {} failed: {e}", self.id());
                    }
                }
            }
        }
    }

    /// Moves to LEAVING and, when `unregister_on_shutdown` is set, removes
    /// the descriptor so the tokens pass to the next clockwise owners.
    /// Otherwise the instance stays visibly LEAVING until forgotten.
    pub async fn shutdown(&self) -> Result<(), RingError> {
        let leaving = self.update(|desc| {
            desc.state = InstanceState::Leaving;
            desc.heartbeat_ms = crate::now_unix_millis();
        });
        self.publish(&leaving).await?;
        info!("Instance {} is LEAVING", self.id());

        if self.config.unregister_on_shutdown {
            let key = self.ring.instance_key(self.id());
            if let Err(e) = self.ring.store().delete(&key).await {
                error!("Failed to unregister {} from the ring: {e}", self.id());
                return Err(e.into());
            }
            self.update(|desc| desc.state = InstanceState::Left);
            info!("Instance {} left the ring", self.id());
        } else {
            info!(
                "Instance {} stays LEAVING until it is forgotten",
                self.id()
            );
        }

        if let Err(e) = self.ring.refresh().await {
            debug!("Ring refresh after shutdown failed: {e}");
        }
        Ok(())
    }

    async fn publish(&self, desc: &InstanceDesc) -> Result<(), RingError> {
        let value = serde_json::to_vec(desc)?;
        self.ring
            .store()
            .put(&self.ring.instance_key(&desc.id), value)
            .await?;
        Ok(())
    }

    fn tokens_taken_by_others(&self) -> HashSet<u32> {
        self.ring
            .snapshot()
            .instances()
            .iter()
            .filter(|d| d.id != self.config.id)
            .flat_map(|d| d.tokens.iter().copied())
            .collect()
    }

    fn update(&self, f: impl FnOnce(&mut InstanceDesc)) -> InstanceDesc {
        let mut desc = self.desc();
        f(&mut desc);
        desc.clone()
    }

    fn desc(&self) -> MutexGuard<'_, InstanceDesc> {
        self.desc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rng(&self) -> MutexGuard<'_, fastrand::Rng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;
    use crate::ring::kv::{InMemoryStore, MembershipStore, StoreError};
    use crate::ring::test_util::desc;
    use std::time::Duration;

    fn config(id: &str) -> LifecyclerConfig {
        LifecyclerConfig {
            id: id.to_string(),
            num_tokens: 16,
            tokens_seed: Some(3),
            ..Default::default()
        }
    }

    fn ring(store: &Arc<InMemoryStore>) -> Arc<Ring> {
        Arc::new(Ring::new(store.clone(), RingConfig::default()))
    }

    async fn stored(store: &InMemoryStore, id: &str) -> Option<InstanceDesc> {
        store
            .get(&format!("generator/{id}"))
            .await
            .unwrap()
            .map(|raw| serde_json::from_slice(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_start_registers_active_instance() {
        let store = Arc::new(InMemoryStore::new());
        let ring = ring(&store);
        let lifecycler = Lifecycler::new(Arc::clone(&ring), config("gen-0"));
        lifecycler.start().await.unwrap();

        assert_eq!(lifecycler.state(), InstanceState::Active);
        let published = stored(&store, "gen-0").await.unwrap();
        assert_eq!(published.state, InstanceState::Active);
        assert_eq!(published.tokens.len(), 16);
        assert_eq!(ring.lookup(0), vec!["gen-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_after_keeps_instance_joining() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycler = Arc::new(Lifecycler::new(
            ring(&store),
            LifecyclerConfig {
                join_after_ms: 5_000,
                ..config("gen-0")
            },
        ));
        let handle = tokio::spawn({
            let lifecycler = Arc::clone(&lifecycler);
            async move { lifecycler.start().await }
        });

        let mut joining = None;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            joining = stored(&store, "gen-0").await;
            if joining.is_some() {
                break;
            }
        }
        assert_eq!(joining.unwrap().state, InstanceState::Joining);

        handle.await.unwrap().unwrap();
        assert_eq!(
            stored(&store, "gen-0").await.unwrap().state,
            InstanceState::Active
        );
    }

    #[tokio::test]
    async fn test_instances_get_distinct_tokens() {
        let store = Arc::new(InMemoryStore::new());
        let a = Lifecycler::new(ring(&store), config("a"));
        let b = Lifecycler::new(ring(&store), config("b"));
        a.start().await.unwrap();
        b.start().await.unwrap();

        let a_tokens: HashSet<u32> = a.tokens().into_iter().collect();
        assert!(b.tokens().iter().all(|t| !a_tokens.contains(t)));
    }

    #[tokio::test]
    async fn test_restart_reuses_tokens() {
        let store = Arc::new(InMemoryStore::new());
        let first = Lifecycler::new(
            ring(&store),
            LifecyclerConfig {
                unregister_on_shutdown: false,
                ..config("gen-0")
            },
        );
        first.start().await.unwrap();
        first.shutdown().await.unwrap();

        let second = Lifecycler::new(
            ring(&store),
            LifecyclerConfig {
                tokens_seed: Some(99),
                ..config("gen-0")
            },
        );
        second.start().await.unwrap();
        assert_eq!(first.tokens(), second.tokens());
    }

    #[tokio::test]
    async fn test_heartbeat_resolves_token_conflicts() {
        let store = Arc::new(InMemoryStore::new());
        let ring = ring(&store);
        let b = Lifecycler::new(Arc::clone(&ring), config("b"));
        b.start().await.unwrap();

        // "a" sorts first and claims two of b's tokens.
        let stolen: Vec<u32> = b.tokens()[..2].to_vec();
        let now = crate::now_unix_millis();
        store
            .put(
                "generator/a",
                serde_json::to_vec(&desc("a", InstanceState::Active, &stolen, now)).unwrap(),
            )
            .await
            .unwrap();
        ring.refresh().await.unwrap();

        b.heartbeat().await.unwrap();
        let tokens = b.tokens();
        assert_eq!(tokens.len(), 16);
        assert!(stolen.iter().all(|t| !tokens.contains(t)));
        assert_eq!(b.token_conflicts(), 2);

        ring.refresh().await.unwrap();
        assert!(ring.snapshot().conflicting_tokens("b").is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_failure_is_counted() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycler = Lifecycler::new(ring(&store), config("gen-0"));
        lifecycler.start().await.unwrap();

        store.set_unreachable(true);
        assert!(matches!(
            lifecycler.heartbeat().await,
            Err(RingError::Store(StoreError::Unreachable))
        ));
        assert_eq!(lifecycler.heartbeat_failures(), 1);

        store.set_unreachable(false);
        lifecycler.heartbeat().await.unwrap();
        assert_eq!(lifecycler.heartbeats(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_unregisters() {
        let store = Arc::new(InMemoryStore::new());
        let ring = ring(&store);
        let lifecycler = Lifecycler::new(Arc::clone(&ring), config("gen-0"));
        lifecycler.start().await.unwrap();
        lifecycler.shutdown().await.unwrap();

        assert_eq!(lifecycler.state(), InstanceState::Left);
        assert!(stored(&store, "gen-0").await.is_none());
        assert!(ring.lookup(0).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_without_unregister_stays_leaving_until_forgotten() {
        let store = Arc::new(InMemoryStore::new());
        let ring = ring(&store);
        let lifecycler = Lifecycler::new(
            Arc::clone(&ring),
            LifecyclerConfig {
                unregister_on_shutdown: false,
                ..config("gen-0")
            },
        );
        lifecycler.start().await.unwrap();
        lifecycler.shutdown().await.unwrap();

        assert_eq!(lifecycler.state(), InstanceState::Leaving);
        assert_eq!(
            stored(&store, "gen-0").await.unwrap().state,
            InstanceState::Leaving
        );
        assert!(ring.lookup(0).is_empty());

        ring.forget("gen-0").await.unwrap();
        assert!(stored(&store, "gen-0").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_heartbeats_until_cancelled() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycler = Arc::new(Lifecycler::new(
            ring(&store),
            LifecyclerConfig {
                heartbeat_period_ms: 1_000,
                ..config("gen-0")
            },
        ));
        lifecycler.start().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let lifecycler = Arc::clone(&lifecycler);
            let cancel = cancel.clone();
            async move { lifecycler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(lifecycler.heartbeats(), 3);
    }
}
