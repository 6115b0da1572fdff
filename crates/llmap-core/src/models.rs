//! Core data models used throughout llmap.
//!
//! These types represent the question, file identities, stages, file
//! statuses and the per-stage verdicts that flow through the triage
//! pipeline.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The user's information need. Immutable and cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question(Arc<str>);

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::from(text.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity of a file within a run (its path as given).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FileId(Arc<str>);

impl FileId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(Arc::from(path.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One phase of relevance evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Stage 1: structural skeleton only.
    Skeleton,
    /// Stage 2: full source text.
    FullSource,
    /// Stage 3: cross-file refinement of stage-2 survivors.
    Refine,
}

impl Stage {
    /// Identifier used in cache keys and diagnostics. Never change these:
    /// doing so invalidates every persisted cache entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Skeleton => "skeleton",
            Stage::FullSource => "full-source",
            Stage::Refine => "refine",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline status of a single file.
///
/// Statuses are ordered; [`FileStatus::advance`] only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    Pending,
    SkeletonPass,
    SkeletonFail,
    FullPass,
    FullFail,
    Refined,
    /// The evaluation at this stage could not produce a verdict.
    StageFailByError(Stage),
}

/// Returned when a status change would move a file backwards.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status transition {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: FileStatus,
    pub to: FileStatus,
}

impl FileStatus {
    fn rank(&self) -> u8 {
        match self {
            FileStatus::Pending => 0,
            FileStatus::StageFailByError(Stage::Skeleton) => 1,
            FileStatus::SkeletonPass | FileStatus::SkeletonFail => 1,
            FileStatus::StageFailByError(Stage::FullSource) => 2,
            FileStatus::FullPass | FileStatus::FullFail => 2,
            FileStatus::StageFailByError(Stage::Refine) => 3,
            FileStatus::Refined => 3,
        }
    }

    /// `true` once the file can take part in no further stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::SkeletonFail
                | FileStatus::FullFail
                | FileStatus::Refined
                | FileStatus::StageFailByError(_)
        )
    }

    /// Move to `next`, refusing to re-enter an earlier stage or to leave a
    /// terminal status.
    pub fn advance(self, next: FileStatus) -> Result<FileStatus, StatusTransitionError> {
        if self.is_terminal() || next.rank() <= self.rank() {
            return Err(StatusTransitionError {
                from: self,
                to: next,
            });
        }
        Ok(next)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Pending => f.write_str("pending"),
            FileStatus::SkeletonPass => f.write_str("skeleton-pass"),
            FileStatus::SkeletonFail => f.write_str("skeleton-fail"),
            FileStatus::FullPass => f.write_str("full-pass"),
            FileStatus::FullFail => f.write_str("full-fail"),
            FileStatus::Refined => f.write_str("refined"),
            FileStatus::StageFailByError(stage) => write!(f, "stage-fail-by-error({})", stage),
        }
    }
}

/// Graded relevance: a yes/no decision plus an optional 0–10 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relevance {
    pub relevant: bool,
    pub score: Option<u8>,
}

impl Relevance {
    pub fn relevant() -> Self {
        Self {
            relevant: true,
            score: None,
        }
    }

    pub fn irrelevant() -> Self {
        Self {
            relevant: false,
            score: None,
        }
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.score = Some(score.min(10));
        self
    }
}

/// Inclusive 1-based line range of a snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// A quoted excerpt of the evaluated text with the model's justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snippet {
    pub lines: Option<LineRange>,
    pub justification: String,
    pub text: String,
}

/// The structured result of evaluating one file at one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageVerdict {
    pub relevance: Relevance,
    pub explanation: String,
    snippets: Vec<Snippet>,
}

impl StageVerdict {
    /// Build a verdict. Snippets are discarded when `relevance` is negative.
    pub fn new(relevance: Relevance, explanation: impl Into<String>, snippets: Vec<Snippet>) -> Self {
        let snippets = if relevance.relevant {
            snippets
        } else {
            Vec::new()
        };
        Self {
            relevance,
            explanation: explanation.into(),
            snippets,
        }
    }

    pub fn is_relevant(&self) -> bool {
        self.relevance.relevant
    }

    pub fn snippets(&self) -> &[Snippet] {
        &self.snippets
    }

    /// Replace the snippet list, keeping the no-snippets-when-irrelevant rule.
    pub fn with_snippets(self, snippets: Vec<Snippet>) -> Self {
        Self::new(self.relevance, self.explanation, snippets)
    }

    /// Keep only the snippets for which `keep` returns `true`.
    pub fn retain_snippets(&mut self, keep: impl FnMut(&Snippet) -> bool) {
        self.snippets.retain(keep);
    }

    /// Merge the per-chunk verdicts of one file, given in chunk order.
    ///
    /// The result is relevant if any part is relevant and its score is the
    /// maximum score. Snippets keep chunk order. Explanations of relevant
    /// parts are joined, or of all parts when none is relevant.
    pub fn combine(mut parts: Vec<StageVerdict>) -> StageVerdict {
        if parts.len() == 1 {
            if let Some(only) = parts.pop() {
                return only;
            }
        }

        let relevant = parts.iter().any(|v| v.is_relevant());
        let score = parts.iter().filter_map(|v| v.relevance.score).max();

        let explanation = parts
            .iter()
            .filter(|v| !relevant || v.is_relevant())
            .map(|v| v.explanation.trim())
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let snippets = parts.into_iter().flat_map(|v| v.snippets).collect();

        StageVerdict::new(Relevance { relevant, score }, explanation, snippets)
    }
}
