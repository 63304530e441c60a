//! Content-addressed conversion cache.
//!
//! [`CacheKey`] hashes everything that determines a conversion's output.
//! [`ConversionCache`] fronts an optional durable [`CacheStore`] with an
//! in-process [`MemoryStore`]: whenever the durable store is missing or
//! errors, reads and writes degrade to memory. Only a full disk surfaces to
//! the caller.
//!
//! Expiry is lazy. An expired entry is dropped by the `get` that finds it;
//! there is no background sweeper.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::format::{ConvertedFile, Format};

pub use memory::MemoryStore;

/// Hex-encoded SHA-256 over the input bytes, formats and sorted options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(
        input: &[u8],
        from: &Format,
        to: &Format,
        options: &BTreeMap<String, String>,
    ) -> Self {
        let mut hasher = Sha256::new();
        // Length-prefix every field so adjacent fields cannot run together.
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(input);
        field(from.as_str().as_bytes());
        field(to.as_str().as_bytes());
        for (name, value) in options {
            field(name.as_bytes());
            field(value.as_bytes());
        }
        Self(hex::encode(&hasher.finalize()[..]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure reported by a backing store.
#[derive(Debug, Error)]
pub enum CacheStoreError {
    /// The store cannot serve right now; the cache falls back to memory.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    /// The store is out of space. Not recoverable by retrying.
    #[error("cache store is full: {0}")]
    StorageFull(String),
}

/// Failure surfaced by [`ConversionCache`] itself.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("durable cache is full; entry kept in memory only: {0}")]
    StorageFull(String),
}

/// A keyed store for conversion results with per-entry TTL.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<ConvertedFile>, CacheStoreError>;

    async fn set(
        &self,
        key: &CacheKey,
        value: &ConvertedFile,
        ttl: Duration,
    ) -> Result<(), CacheStoreError>;
}

#[derive(Clone)]
pub struct ConversionCache {
    durable: Option<Arc<dyn CacheStore>>,
    memory: Arc<MemoryStore>,
}

impl std::fmt::Debug for ConversionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionCache")
            .field("durable", &self.durable.as_ref().map(|s| s.name()))
            .finish()
    }
}

impl Default for ConversionCache {
    fn default() -> Self {
        Self::memory_only()
    }
}

impl ConversionCache {
    pub fn memory_only() -> Self {
        Self {
            durable: None,
            memory: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_durable(store: Arc<dyn CacheStore>) -> Self {
        Self {
            durable: Some(store),
            memory: Arc::new(MemoryStore::new()),
        }
    }

    /// Look up `key`, consulting the durable store first and memory second.
    pub async fn get(&self, key: &CacheKey) -> Option<ConvertedFile> {
        if let Some(store) = &self.durable {
            match store.get(key).await {
                Ok(Some(hit)) => return Some(hit),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(store = store.name(), %key, error = %e, "cache read degraded to memory");
                }
            }
        }
        self.memory.lookup(key)
    }

    /// Store `value` under `key`. Falls back to memory when the durable store
    /// fails; a full disk still lands in memory but is reported.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: &ConvertedFile,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let Some(store) = &self.durable else {
            self.memory.insert(key, value, ttl);
            return Ok(());
        };
        match store.set(key, value, ttl).await {
            Ok(()) => Ok(()),
            Err(CacheStoreError::Unavailable(reason)) => {
                tracing::warn!(store = store.name(), %key, %reason, "cache write degraded to memory");
                self.memory.insert(key, value, ttl);
                Ok(())
            }
            Err(CacheStoreError::StorageFull(reason)) => {
                self.memory.insert(key, value, ttl);
                Err(CacheError::StorageFull(reason))
            }
        }
    }
}
