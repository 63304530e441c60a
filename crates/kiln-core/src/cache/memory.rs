use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheKey, CacheStore, CacheStoreError};
use crate::format::ConvertedFile;

#[derive(Debug)]
struct Entry {
    value: ConvertedFile,
    expires_at: Instant,
}

/// In-process fallback store. Expired entries are evicted on read.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<ConvertedFile> {
        self.lookup_at(key, Instant::now())
    }

    fn lookup_at(&self, key: &CacheKey, now: Instant) -> Option<ConvertedFile> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &CacheKey, value: &ConvertedFile, ttl: Duration) {
        let entry = Entry {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<ConvertedFile>, CacheStoreError> {
        Ok(self.lookup(key))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &ConvertedFile,
        ttl: Duration,
    ) -> Result<(), CacheStoreError> {
        self.insert(key, value, ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use std::collections::BTreeMap;

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let store = MemoryStore::new();
        let png = Format::parse("png").unwrap();
        let key = CacheKey::new(b"x", &png, &png, &BTreeMap::new());
        store.insert(&key, &ConvertedFile::new(&png, vec![9]), Duration::from_millis(50));

        assert!(store.lookup(&key).is_some());
        assert_eq!(store.len(), 1);

        let later = Instant::now() + Duration::from_secs(1);
        assert!(store.lookup_at(&key, later).is_none());
        assert!(store.is_empty());
    }
}
