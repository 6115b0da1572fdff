//! Response cache abstraction for llmap.
//!
//! The [`CacheStore`] trait defines the durable key-value operations the
//! stage evaluator needs, enabling pluggable backends (SQLite in the app
//! crate, in-memory here). [`CacheMode`] decides which of those operations
//! a run is allowed to perform.
//!
//! Implementations must be `Send + Sync` and must make each `put` atomic:
//! a later `get` either sees the complete entry or nothing.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::fingerprint::CacheKey;

/// A stored model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Raw response text exactly as the model returned it.
    pub response: String,
    /// Unix timestamp (seconds) of the write.
    pub created_at: i64,
}

/// Failure of the backing store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be reached or a statement failed. Recoverable:
    /// the run continues without caching.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// The store's integrity check failed. Run-fatal.
    #[error("cache store is corrupt: {0}")]
    Corrupt(String),
}

/// Which cache operations a run may perform.
///
/// | Mode | Reads | Writes |
/// |------|-------|--------|
/// | `disabled` | never | never |
/// | `read-only` | yes | suppressed |
/// | `write-only` | never | yes |
/// | `read-write` | yes | yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    Disabled,
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl CacheMode {
    pub fn can_read(&self) -> bool {
        matches!(self, CacheMode::ReadOnly | CacheMode::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, CacheMode::WriteOnly | CacheMode::ReadWrite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Disabled => "disabled",
            CacheMode::ReadOnly => "read-only",
            CacheMode::WriteOnly => "write-only",
            CacheMode::ReadWrite => "read-write",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = anyhow::Error;

    /// Accepts the canonical names plus the short forms `none`, `read`,
    /// `write` and `read/write`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "none" | "off" => Ok(CacheMode::Disabled),
            "read-only" | "read" => Ok(CacheMode::ReadOnly),
            "write-only" | "write" => Ok(CacheMode::WriteOnly),
            "read-write" | "read/write" | "rw" => Ok(CacheMode::ReadWrite),
            other => anyhow::bail!(
                "Unknown cache mode: '{}'. Must be disabled, read-only, write-only, or read-write.",
                other
            ),
        }
    }
}

/// Abstract durable key-value store for model responses.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](CacheStore::get) | Look up a response by key |
/// | [`put`](CacheStore::put) | Store a response if the key is absent |
/// | [`discard`](CacheStore::discard) | Remove an entry that can no longer be used |
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up the entry for `key`.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `response` under `key`.
    ///
    /// Must be atomic, and must leave an existing entry untouched: an
    /// identical key always resolves to the first answer written.
    async fn put(&self, key: &CacheKey, response: &str) -> Result<(), CacheError>;

    /// Remove the entry for `key`, if any.
    async fn discard(&self, key: &CacheKey) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_permissions() {
        assert!(!CacheMode::Disabled.can_read() && !CacheMode::Disabled.can_write());
        assert!(CacheMode::ReadOnly.can_read() && !CacheMode::ReadOnly.can_write());
        assert!(!CacheMode::WriteOnly.can_read() && CacheMode::WriteOnly.can_write());
        assert!(CacheMode::ReadWrite.can_read() && CacheMode::ReadWrite.can_write());
    }

    #[test]
    fn test_mode_parses_short_forms() {
        assert_eq!("none".parse::<CacheMode>().unwrap(), CacheMode::Disabled);
        assert_eq!("read".parse::<CacheMode>().unwrap(), CacheMode::ReadOnly);
        assert_eq!("write".parse::<CacheMode>().unwrap(), CacheMode::WriteOnly);
        assert_eq!("read/write".parse::<CacheMode>().unwrap(), CacheMode::ReadWrite);
        assert_eq!("Read-Write".parse::<CacheMode>().unwrap(), CacheMode::ReadWrite);
        assert!("sometimes".parse::<CacheMode>().is_err());
    }
}
