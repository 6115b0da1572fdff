//! Model invocation capability.
//!
//! Defines the [`ModelClient`] trait the stage evaluator calls, the
//! provider-neutral [`Prompt`] it sends, and the [`FailureKind`]
//! classification that drives the retry policy. Concrete network clients
//! live in the `llmap` app crate; tests supply stubs.
//!
//! A client performs exactly one request per [`invoke`](ModelClient::invoke).
//! It never retries on its own.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Chat role of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An ordered list of chat messages.
///
/// Messages shared by every file of a stage come first so providers can
/// reuse their prompt cache across requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Prompt {
    messages: Vec<Message>,
}

impl Prompt {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a follow-up exchange: the model's previous reply and a user
    /// message asking it to correct that reply.
    pub fn with_follow_up(&self, previous_reply: &str, correction: impl Into<String>) -> Self {
        let mut messages = self.messages.clone();
        messages.push(Message::assistant(previous_reply));
        messages.push(Message::user(correction));
        Self { messages }
    }

    /// Append a user message asking for a fresh answer, for replies that
    /// were empty or could not be decoded.
    pub fn with_correction(&self, correction: impl Into<String>) -> Self {
        let mut messages = self.messages.clone();
        messages.push(Message::user(correction));
        Self { messages }
    }

    /// Concatenated text of every message, for stubs and logging.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Classified failure of a single model invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The provider asked us to slow down (HTTP 429). Retried with backoff.
    RateLimited,
    /// Connection problem or server error (HTTP 5xx). Retried with backoff.
    Transient,
    /// The response was empty or undecodable. Retried once with a
    /// corrective prompt.
    Malformed,
    /// The per-call timeout elapsed. Retried; counts toward the budget.
    Timeout,
    /// The provider refused the request (bad request, auth, permission).
    /// Never retried.
    Rejected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate-limited",
            FailureKind::Transient => "transient",
            FailureKind::Malformed => "malformed",
            FailureKind::Timeout => "timeout",
            FailureKind::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by [`ModelClient::invoke`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ModelError {
    pub kind: FailureKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The model invocation capability: submit a prompt, receive text or a
/// classified failure.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use llmap_core::model::{ModelClient, ModelError, Prompt};
/// use std::time::Duration;
///
/// struct Echo;
///
/// #[async_trait]
/// impl ModelClient for Echo {
///     async fn invoke(&self, prompt: &Prompt, _model: &str, _timeout: Duration) -> Result<String, ModelError> {
///         Ok(prompt.text())
///     }
/// }
/// ```
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send `prompt` to `model` and return the response text.
    ///
    /// `timeout` is the caller's per-call budget; clients should configure
    /// their transport with it. The caller also enforces it.
    async fn invoke(&self, prompt: &Prompt, model: &str, timeout: Duration) -> Result<String, ModelError>;
}
