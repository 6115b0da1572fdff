//! Run-scoped view of the response cache.
//!
//! [`ResponseCache`] applies a [`CacheMode`] to a [`CacheStore`] and
//! handles store failures: the first failed read or write switches the
//! cache to `disabled` for the rest of the run and records one warning.
//! Evaluation continues uncached.

use std::sync::{Arc, OnceLock};

use llmap_core::cache::{CacheMode, CacheStore};
use llmap_core::fingerprint::CacheKey;
use serde::Serialize;
use tracing::warn;

/// Result of a cache lookup, as reported in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(String),
    Miss,
    /// Reads are not allowed in the current mode.
    Bypassed,
}

impl Lookup {
    pub fn status(&self) -> CacheStatus {
        match self {
            Lookup::Hit(_) => CacheStatus::Hit,
            Lookup::Miss => CacheStatus::Miss,
            Lookup::Bypassed => CacheStatus::Bypassed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypassed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypassed => "bypassed",
        }
    }
}

pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
    mode: CacheMode,
    degraded: OnceLock<String>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, mode: CacheMode) -> Self {
        Self {
            store: Some(store),
            mode,
            degraded: OnceLock::new(),
        }
    }

    /// A cache that never reads or writes.
    pub fn disabled() -> Self {
        Self {
            store: None,
            mode: CacheMode::Disabled,
            degraded: OnceLock::new(),
        }
    }

    /// Mode currently in effect (`disabled` after degradation).
    pub fn mode(&self) -> CacheMode {
        if self.degraded.get().is_some() || self.store.is_none() {
            CacheMode::Disabled
        } else {
            self.mode
        }
    }

    /// The degradation warning, if the store failed during the run.
    pub fn degradation(&self) -> Option<&str> {
        self.degraded.get().map(String::as_str)
    }

    fn degrade(&self, reason: String) {
        let mut first = false;
        self.degraded.get_or_init(|| {
            first = true;
            format!("cache disabled for the rest of the run: {}", reason)
        });
        if first {
            warn!(reason = %reason, "Response cache unavailable, continuing without it");
        }
    }

    pub async fn lookup(&self, key: &CacheKey) -> Lookup {
        let Some(store) = self.store.as_ref().filter(|_| self.mode().can_read()) else {
            return Lookup::Bypassed;
        };
        match store.get(key).await {
            Ok(Some(entry)) => Lookup::Hit(entry.response),
            Ok(None) => Lookup::Miss,
            Err(e) => {
                self.degrade(e.to_string());
                Lookup::Bypassed
            }
        }
    }

    /// Store a validated response, when the mode allows writes.
    pub async fn store(&self, key: &CacheKey, response: &str) {
        let Some(store) = self.store.as_ref().filter(|_| self.mode().can_write()) else {
            return;
        };
        if let Err(e) = store.put(key, response).await {
            self.degrade(e.to_string());
        }
    }

    /// Drop an entry that could not be used. Suppressed in read-only mode.
    pub async fn discard(&self, key: &CacheKey) {
        let Some(store) = self.store.as_ref().filter(|_| self.mode().can_write()) else {
            return;
        };
        if let Err(e) = store.discard(key).await {
            self.degrade(e.to_string());
        }
    }
}
