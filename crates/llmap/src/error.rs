//! Error taxonomy for llmap runs.
//!
//! Per-file failures ([`EvaluationError`]) demote a file to the
//! inconclusive bucket and never stop a run. [`RunError`]s abort it.
//! Configuration and I/O plumbing outside the pipeline uses `anyhow`.

use llmap_core::model::FailureKind;
use llmap_core::models::StatusTransitionError;
use thiserror::Error;

/// Why one file could not be evaluated at one stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    /// The model capability kept failing until the retry budget ran out,
    /// or failed in a way that is never retried.
    #[error("model failure ({kind}) after {attempts} attempt(s): {message}")]
    Model {
        kind: FailureKind,
        attempts: u32,
        message: String,
    },
    /// The model answered, but not in the expected format, even after a
    /// corrective follow-up.
    #[error("unparseable response after {attempts} attempt(s): {message}")]
    Parse { attempts: u32, message: String },
    #[error("cannot read source: {0}")]
    Source(String),
}

impl EvaluationError {
    /// Short class name used in reports: `model`, `parse` or `source`.
    pub fn class(&self) -> &'static str {
        match self {
            EvaluationError::Model { .. } => "model",
            EvaluationError::Parse { .. } => "parse",
            EvaluationError::Source(_) => "source",
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            EvaluationError::Model { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            EvaluationError::Model { attempts, .. } | EvaluationError::Parse { attempts, .. } => {
                *attempts
            }
            EvaluationError::Source(_) => 0,
        }
    }
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("cache store is corrupt: {0}")]
    CacheCorrupt(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    InvalidTransition(#[from] StatusTransitionError),
}
