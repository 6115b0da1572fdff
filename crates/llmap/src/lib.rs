//! # llmap
//!
//! **Staged LLM relevance triage of source files.**
//!
//! Given a natural-language question and a list of source files, llmap asks
//! a language model which files matter and why. Cost stays bounded because
//! files are filtered in stages, cheapest first, and every model response is
//! cached on disk.
//!
//! ## Architecture
//!
//! ```text
//! paths ──▶ Skeleton ──▶ Full source ──▶ Refine ──▶ ranked records
//!  (stdin)   stage 1       stage 2       stage 3      (stdout)
//!               │             │             │
//!               └─────────────┴──────┬──────┘
//!                                    ▼
//!                       ResponseCache (SQLite)
//!                       ModelClient (HTTP)
//! ```
//!
//! 1. **Skeleton**: files with a tree-sitter grammar are judged from their
//!    declarations only. Files judged irrelevant leave the pool.
//! 2. **Full source**: the remaining files are judged from the full text
//!    (chunked if large), yielding an explanation and code snippets.
//! 3. **Refine**: a stronger model ranks the survivors from their
//!    explanations and snippets.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite pool for the response cache |
//! | [`migrate`] | Cache schema creation |
//! | [`sqlite_cache`] | Durable `CacheStore` on SQLite |
//! | [`cache`] | Cache modes and degradation for one run |
//! | [`client`] | OpenAI-compatible chat-completions `ModelClient` |
//! | [`prompts`] | Prompt text for every stage |
//! | [`skeleton`] | Java and Python skeleton grammars |
//! | [`input`] | File units, path lists and sampling |
//! | [`evaluator`] | One file at one stage: cache, model, retries, parsing |
//! | [`pipeline`] | Stage barriers, concurrency bound, cancellation |
//! | [`refine`] | Snippet dedup, collation and ranking of survivors |
//! | [`diagnostics`] | Per-stage events and sinks |
//! | [`output`] | Text and JSON result rendering |
//! | [`error`] | Evaluation and run error types |
//!
//! Pure types (verdict grammar, cache keys, the capability traits) live in
//! the `llmap-core` crate.

pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod evaluator;
pub mod input;
pub mod migrate;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod refine;
pub mod skeleton;
pub mod sqlite_cache;
