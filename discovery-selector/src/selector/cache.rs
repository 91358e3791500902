//! Persisted short-circuit cache for the last successful selection.

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    sync::Mutex,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::error::StorageError;
use crate::util;

const CACHE_KEY: &str = "discovery-selector:selected-node";

/// A pluggable persistent key-value capability (browser localStorage, a file,
/// a database row). The selector stores at most one small JSON entry.
///
/// The storage is treated as external and possibly slow; all failures are
/// swallowed by the selector and never fail a selection.
#[async_trait]
pub trait SelectorStorage: Debug + Send + Sync {
    /// Reads the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Deletes the value stored under `key`. Absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// A trivial in-memory [`SelectorStorage`], useful for tests and for callers
/// that want caching within a single process only.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SelectorStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    endpoint: String,
    timestamp: u64,
}

/// Best-effort wrapper over the injected storage. Every method swallows and
/// logs storage failures; selection proceeds as if the cache were empty.
#[derive(Debug)]
pub(crate) struct SelectionCache {
    storage: Option<Arc<dyn SelectorStorage>>,
    ttl: Option<Duration>,
}

impl SelectionCache {
    pub fn new(storage: Option<Arc<dyn SelectorStorage>>, ttl: Option<Duration>) -> Self {
        Self { storage, ttl }
    }

    /// Reads the cached selection. Entries that fail the allowlist or have
    /// expired are removed and treated as absent.
    pub async fn get(&self, allowlist: Option<&HashSet<Url>>) -> Option<Url> {
        let storage = self.storage.as_ref()?;
        let raw = match storage.get(CACHE_KEY).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!("could not read cached endpoint: {err}");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("discarding malformed cache entry: {err}");
                self.clear().await;
                return None;
            }
        };
        let endpoint = match Url::parse(&entry.endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!("discarding cache entry with invalid endpoint: {err}");
                self.clear().await;
                return None;
            }
        };

        let allowed = allowlist.map_or(true, |list| list.contains(&endpoint));
        let expired = self
            .ttl
            .is_some_and(|ttl| util::now_millis().saturating_sub(entry.timestamp) > ttl.as_millis() as u64);
        if !allowed || expired {
            debug!(%endpoint, allowed, expired, "cached endpoint no longer usable");
            self.clear().await;
            return None;
        }
        Some(endpoint)
    }

    pub async fn set(&self, endpoint: &Url) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let entry = CacheEntry {
            endpoint: endpoint.to_string(),
            timestamp: util::now_millis(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("could not serialize cache entry: {err}");
                return;
            }
        };
        if let Err(err) = storage.set(CACHE_KEY, &raw).await {
            warn!("could not persist selected endpoint: {err}");
        }
    }

    pub async fn clear(&self) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        if let Err(err) = storage.remove(CACHE_KEY).await {
            warn!("could not remove cached endpoint: {err}");
        }
    }
}
