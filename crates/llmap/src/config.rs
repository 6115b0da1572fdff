//! Configuration parsing and validation.
//!
//! llmap reads an optional TOML file. Every section and field has a
//! default, so an empty file (or no file at all) is a valid configuration.
//!
//! # Example
//!
//! ```toml
//! [cache]
//! path = "~/.cache/llmap/cache.sqlite"
//! mode = "read-write"            # disabled | read-only | write-only | read-write
//!
//! [model]
//! provider = "deepseek"          # deepseek | openrouter | gemini | openai
//! analyze = "deepseek-chat"
//! refine = "deepseek-reasoner"
//!
//! [pipeline]
//! max_concurrent_requests = 200
//! max_attempts = 10
//! ```
//!
//! The API key is never stored in the file; it is read from the
//! environment variable named by `model.api_key_env` (or the provider's
//! default, e.g. `DEEPSEEK_API_KEY`).

use anyhow::{Context, Result};
use llmap_core::cache::CacheMode;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./llmap.toml";

pub const PROVIDERS: &[&str] = &["deepseek", "openrouter", "gemini", "openai"];

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[cache]`: where responses are stored and how the store may be used.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub mode: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            mode: CacheMode::default(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("~/.cache/llmap/cache.sqlite")
}

fn deserialize_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CacheMode, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// `[model]`: provider and model selection.
///
/// `base_url`, `api_key_env`, `analyze` and `refine` fall back to the
/// provider's defaults when unset.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Model for the skeleton and full-source stages.
    #[serde(default)]
    pub analyze: Option<String>,
    /// Model for refinement.
    #[serde(default)]
    pub refine: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            api_key_env: None,
            analyze: None,
            refine: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}
fn default_max_tokens() -> u32 {
    8000
}
fn default_timeout_secs() -> u64 {
    300
}

/// `[pipeline]`: concurrency, retry and size limits.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_char_budget")]
    pub max_skeleton_chars: usize,
    #[serde(default = "default_char_budget")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_char_budget")]
    pub max_refine_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_skeleton_chars: default_char_budget(),
            max_chunk_chars: default_char_budget(),
            max_refine_chars: default_char_budget(),
        }
    }
}

fn default_max_concurrent_requests() -> usize {
    200
}
fn default_max_attempts() -> u32 {
    10
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_char_budget() -> usize {
    200_000
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    config.cache.path = expand_home(&config.cache.path);

    if !PROVIDERS.contains(&config.model.provider.as_str()) {
        anyhow::bail!(
            "Unknown model provider: '{}'. Must be deepseek, openrouter, gemini, or openai.",
            config.model.provider
        );
    }
    if config.model.max_tokens == 0 {
        anyhow::bail!("model.max_tokens must be > 0");
    }
    if config.model.timeout_secs == 0 {
        anyhow::bail!("model.timeout_secs must be > 0");
    }

    let p = &config.pipeline;
    if p.max_concurrent_requests == 0 {
        anyhow::bail!("pipeline.max_concurrent_requests must be >= 1");
    }
    if p.max_attempts == 0 {
        anyhow::bail!("pipeline.max_attempts must be >= 1");
    }
    if p.max_skeleton_chars == 0 || p.max_chunk_chars == 0 || p.max_refine_chars == 0 {
        anyhow::bail!("pipeline character budgets must be > 0");
    }

    Ok(config)
}

/// Load the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Load `path` if given. Otherwise load [`DEFAULT_CONFIG_PATH`] when it
/// exists, or fall back to built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config(default)
            } else {
                parse_config("")
            }
        }
    }
}
