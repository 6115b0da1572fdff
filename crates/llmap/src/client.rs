//! OpenAI-compatible chat-completions client.
//!
//! DeepSeek, OpenRouter, Gemini (through its OpenAI endpoint) and OpenAI all
//! accept `POST {base_url}/chat/completions`. [`ChatClient`] implements
//! [`ModelClient`] for them; it performs one HTTP request per call and maps
//! the outcome onto [`FailureKind`]. Retries belong to the stage evaluator.
//!
//! # Failure mapping
//!
//! | Outcome | Kind |
//! |---------|------|
//! | HTTP 429 | `RateLimited` |
//! | HTTP 5xx, connection error, provider error body | `Transient` |
//! | request timed out | `Timeout` |
//! | other HTTP 4xx | `Rejected` |
//! | undecodable body, missing or empty content | `Malformed` |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use llmap_core::model::{FailureKind, ModelClient, ModelError, Prompt};

use crate::config::ModelConfig;

/// Built-in settings of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDefaults {
    pub base_url: &'static str,
    pub api_key_env: &'static str,
    pub analyze: &'static str,
    pub refine: &'static str,
}

pub fn provider_defaults(provider: &str) -> Result<ProviderDefaults> {
    let defaults = match provider {
        "deepseek" => ProviderDefaults {
            base_url: "https://api.deepseek.com",
            api_key_env: "DEEPSEEK_API_KEY",
            analyze: "deepseek-chat",
            refine: "deepseek-reasoner",
        },
        "openrouter" => ProviderDefaults {
            base_url: "https://openrouter.ai/api/v1",
            api_key_env: "OPENROUTER_API_KEY",
            analyze: "deepseek/deepseek-chat",
            refine: "deepseek/deepseek-r1",
        },
        "gemini" => ProviderDefaults {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai/",
            api_key_env: "GEMINI_API_KEY",
            analyze: "gemini-2.0-flash",
            refine: "gemini-2.0-pro-exp-02-05",
        },
        "openai" => ProviderDefaults {
            base_url: "https://api.openai.com/v1",
            api_key_env: "OPENAI_API_KEY",
            analyze: "gpt-4o-mini",
            refine: "gpt-4o",
        },
        other => bail!("Unknown model provider: {}", other),
    };
    Ok(defaults)
}

/// Model ids for the analysis stages and for refinement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub analyze: String,
    pub refine: String,
}

impl ModelSelection {
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let defaults = provider_defaults(&config.provider)?;
        Ok(Self {
            analyze: config
                .analyze
                .clone()
                .unwrap_or_else(|| defaults.analyze.to_string()),
            refine: config
                .refine
                .clone()
                .unwrap_or_else(|| defaults.refine.to_string()),
        })
    }
}

/// Chat-completions client for one provider.
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from `[model]` config.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown provider or when the API key
    /// environment variable is not set.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let defaults = provider_defaults(&config.provider)?;
        let key_env = config
            .api_key_env
            .clone()
            .unwrap_or_else(|| defaults.api_key_env.to_string());
        let api_key = match std::env::var(&key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", key_env),
        };
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| defaults.base_url.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint(&base_url),
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

fn endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

/// Extract the assistant text from a chat-completions response body.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, ModelError> {
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(ModelError::new(FailureKind::Transient, message));
    }

    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            ModelError::new(FailureKind::Malformed, "response has no choices[0].message.content")
        })?;

    if content.trim().is_empty() {
        return Err(ModelError::new(FailureKind::Malformed, "response content is empty"));
    }
    Ok(content.to_string())
}

fn classify_status(status: reqwest::StatusCode) -> FailureKind {
    if status.as_u16() == 429 {
        FailureKind::RateLimited
    } else if status.is_server_error() {
        FailureKind::Transient
    } else {
        FailureKind::Rejected
    }
}

#[async_trait]
impl ModelClient for ChatClient {
    async fn invoke(&self, prompt: &Prompt, model: &str, timeout: Duration) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "model": model,
            "messages": prompt.messages(),
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await;

        let response = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(ModelError::new(FailureKind::Timeout, e.to_string()))
            }
            Err(e) => return Err(ModelError::new(FailureKind::Transient, e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ModelError::new(
                classify_status(status),
                format!("API error {}: {}", status, body_text),
            ));
        }

        let json: serde_json::Value = match response.json().await {
            Ok(json) => json,
            Err(e) if e.is_timeout() => {
                return Err(ModelError::new(FailureKind::Timeout, e.to_string()))
            }
            Err(e) => return Err(ModelError::new(FailureKind::Malformed, e.to_string())),
        };
        parse_chat_response(&json)
    }
}
