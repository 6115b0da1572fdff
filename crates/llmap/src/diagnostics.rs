//! Per-stage diagnostic events.
//!
//! The pipeline emits one [`DiagnosticEvent`] per file per stage, plus one
//! per refinement group, to a [`DiagnosticSink`]. Events never go to
//! stdout, so result output stays parseable for scripts.
//!
//! An event carries enough to rerun a single evaluation by hand: the stage,
//! the file, the failure kind and the number of attempts.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use llmap_core::models::Stage;

use crate::cache::CacheStatus;

/// How one evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Relevant,
    Irrelevant,
    /// No skeleton grammar for the file; it goes straight to full source.
    NotApplicable,
    Failed,
    Cancelled,
    /// A refinement group was ranked.
    Ranked,
    /// A refinement group fell back to arrival order.
    Unranked,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Relevant => "relevant",
            Outcome::Irrelevant => "irrelevant",
            Outcome::NotApplicable => "not-applicable",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
            Outcome::Ranked => "ranked",
            Outcome::Unranked => "unranked",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEvent {
    pub stage: Stage,
    /// File path, or a group label for refinement events.
    pub subject: String,
    pub outcome: Outcome,
    /// `model:<kind>`, `parse` or `source` when the outcome is `Failed`.
    pub failure: Option<String>,
    pub cache: Option<CacheStatus>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl DiagnosticEvent {
    pub fn new(stage: Stage, subject: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            stage,
            subject: subject.into(),
            outcome,
            failure: None,
            cache: None,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "event": "stage",
            "stage": self.stage.as_str(),
            "subject": self.subject,
            "outcome": self.outcome.as_str(),
            "failure": self.failure,
            "cache": self.cache.map(|c| c.as_str()),
            "attempts": self.attempts,
            "elapsed_ms": self.elapsed.as_millis() as u64,
        })
    }
}

/// Receives diagnostic events. Called concurrently from stage tasks.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: &DiagnosticEvent);
}

/// Routes events through `tracing`: failures at `warn`, the rest at `info`.
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn emit(&self, event: &DiagnosticEvent) {
        let cache = event.cache.map(|c| c.as_str()).unwrap_or("-");
        let failure = event.failure.as_deref().unwrap_or("-");
        let elapsed_ms = event.elapsed.as_millis() as u64;
        if event.outcome == Outcome::Failed {
            tracing::warn!(
                stage = event.stage.as_str(),
                file = %event.subject,
                outcome = event.outcome.as_str(),
                failure,
                cache,
                attempts = event.attempts,
                elapsed_ms,
                "stage evaluation failed"
            );
        } else {
            tracing::info!(
                stage = event.stage.as_str(),
                file = %event.subject,
                outcome = event.outcome.as_str(),
                cache,
                attempts = event.attempts,
                elapsed_ms,
                "stage evaluated"
            );
        }
    }
}

/// One JSON object per line on stderr.
pub struct JsonDiagnostics;

impl DiagnosticSink for JsonDiagnostics {
    fn emit(&self, event: &DiagnosticEvent) {
        if let Ok(line) = serde_json::to_string(&event.to_json()) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// Discards every event.
pub struct NoDiagnostics;

impl DiagnosticSink for NoDiagnostics {
    fn emit(&self, _event: &DiagnosticEvent) {}
}

/// Keeps events in memory, for tests and embedding applications.
#[derive(Default)]
pub struct MemoryDiagnostics {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn for_stage(&self, stage: Stage) -> Vec<DiagnosticEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .collect()
    }
}

impl DiagnosticSink for MemoryDiagnostics {
    fn emit(&self, event: &DiagnosticEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Diagnostics mode for the CLI: off, human (tracing) or JSON lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiagnosticsMode {
    Off,
    Human,
    Json,
}

impl DiagnosticsMode {
    /// Default: human diagnostics when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            DiagnosticsMode::Human
        } else {
            DiagnosticsMode::Off
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" => Ok(DiagnosticsMode::Off),
            "human" => Ok(DiagnosticsMode::Human),
            "json" => Ok(DiagnosticsMode::Json),
            other => anyhow::bail!(
                "Unknown diagnostics mode: '{}'. Must be off, human, or json.",
                other
            ),
        }
    }

    pub fn sink(&self) -> Box<dyn DiagnosticSink> {
        match self {
            DiagnosticsMode::Off => Box::new(NoDiagnostics),
            DiagnosticsMode::Human => Box::new(TracingDiagnostics),
            DiagnosticsMode::Json => Box::new(JsonDiagnostics),
        }
    }
}
