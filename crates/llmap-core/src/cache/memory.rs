//! In-memory [`CacheStore`] implementation for tests and embedding.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Entries live as long as the
//! store value, so sharing one `Arc<InMemoryCacheStore>` between two
//! pipelines simulates a persistent cache across runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::fingerprint::CacheKey;

use super::{CacheEntry, CacheError, CacheStore};

/// In-memory response store.
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite an entry directly, bypassing the keep-first rule.
    /// Intended for seeding tests with pre-existing records.
    pub fn seed(&self, key: CacheKey, response: impl Into<String>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key,
                CacheEntry {
                    response: response.into(),
                    created_at: chrono::Utc::now().timestamp(),
                },
            );
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> CacheError {
    CacheError::Unavailable("in-memory cache lock poisoned".to_string())
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, response: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            response: response.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }

    async fn discard(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
