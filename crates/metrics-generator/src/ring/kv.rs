// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Membership store seam.
//!
//! The ring is a client of an eventually consistent key-value store. Every
//! instance writes only its own key, so implementations need no cross-key
//! transactions. [`MembershipStore::watch`] hands out a receiver carrying the
//! store version; it changes whenever any key changes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("membership store is unreachable")]
    Unreachable,

    #[error("membership store error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every `(key, value)` whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Change notifications. The carried value is the store version.
    fn watch(&self) -> watch::Receiver<u64>;
}

/// Process-local store used by single-node deployments and tests.
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    version: watch::Sender<u64>,
    unreachable: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        InMemoryStore {
            entries: Mutex::new(BTreeMap::new()),
            version,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Makes every operation fail with [`StoreError::Unreachable`] until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Unreachable)
        } else {
            Ok(())
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl MembershipStore for InMemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        let changed = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.insert(key.to_string(), value.clone()).as_ref() != Some(&value)
        };
        if changed {
            self.bump();
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if removed {
            self.bump();
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check()?;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let store = InMemoryStore::new();
        store.put("generator/b", b"2".to_vec()).await.unwrap();
        store.put("generator/a", b"1".to_vec()).await.unwrap();
        store.put("other/c", b"3".to_vec()).await.unwrap();

        assert_eq!(store.get("generator/a").await.unwrap(), Some(b"1".to_vec()));
        let listed = store.list("generator/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["generator/a", "generator/b"]);

        store.delete("generator/a").await.unwrap();
        assert_eq!(store.get("generator/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_sees_changes_only() {
        let store = InMemoryStore::new();
        let mut rx = store.watch();

        store.put("k", b"v".to_vec()).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        // Writing the same value is not a change.
        store.put("k", b"v".to_vec()).await.unwrap();
        assert!(!rx.has_changed().unwrap());

        store.delete("missing").await.unwrap();
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_operation() {
        let store = InMemoryStore::new();
        store.set_unreachable(true);
        assert_eq!(
            store.put("k", Vec::new()).await,
            Err(StoreError::Unreachable)
        );
        assert_eq!(store.list("").await, Err(StoreError::Unreachable));

        store.set_unreachable(false);
        assert!(store.list("").await.unwrap().is_empty());
    }
}
