//! # llmap Core
//!
//! Shared, runtime-free logic for llmap: the data model, the verdict and
//! ranking grammars, cache keys and the cache store trait, the skeleton
//! extraction capability, and the model invocation capability.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. The
//! `llmap` app crate supplies the concrete grammars, the SQLite cache store,
//! the HTTP model client and the pipeline that drives them.

pub mod cache;
pub mod chunk;
pub mod fingerprint;
pub mod model;
pub mod models;
pub mod ranking;
pub mod skeleton;
pub mod verdict;
