//! Cross-file refinement of full-source survivors.
//!
//! Survivors are deduplicated, rendered to text and collated into groups
//! that fit `pipeline.max_refine_chars`. Each group gets one ranking call
//! on the refine model. Ranking is advisory: every survivor ends up in the
//! output, ranked or not.

use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use llmap_core::models::{FileId, Stage, StageVerdict};
use llmap_core::ranking::{dedup_snippets, RankedFile};

use crate::cache::CacheStatus;
use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, Outcome};
use crate::error::EvaluationError;
use crate::evaluator::{Completion, StageEvaluator};
use crate::pipeline::RequestLimiter;

/// A file that passed the full-source stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Survivor {
    pub file: FileId,
    pub verdict: StageVerdict,
}

/// One output record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub file: FileId,
    pub verdict: StageVerdict,
    /// Rank within the record's refinement group, when the model listed it.
    pub rank: Option<usize>,
    pub why: Option<String>,
    /// The file took part in a successful ranking call.
    #[serde(skip)]
    pub refined: bool,
}

impl FileRecord {
    fn unranked(survivor: Survivor) -> Self {
        Self {
            file: survivor.file,
            verdict: survivor.verdict,
            rank: None,
            why: None,
            refined: false,
        }
    }
}

/// How refinement ended for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefinementState {
    /// Refinement was turned off; records are in arrival order.
    Skipped,
    /// Every group was ranked (or there was nothing to rank).
    Ranked,
    /// At least one group fell back to arrival order.
    Degraded,
    /// The run was cancelled before every group was ranked.
    Cancelled,
}

impl RefinementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinementState::Skipped => "skipped",
            RefinementState::Ranked => "ranked",
            RefinementState::Degraded => "degraded",
            RefinementState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub records: Vec<FileRecord>,
    pub state: RefinementState,
    pub warnings: Vec<String>,
    pub snippets_removed: usize,
    pub groups: usize,
}

impl Refinement {
    /// Survivors in arrival order, without any ranking call.
    pub fn unranked(survivors: Vec<Survivor>, state: RefinementState) -> Self {
        Self {
            records: survivors.into_iter().map(FileRecord::unranked).collect(),
            state,
            warnings: Vec::new(),
            snippets_removed: 0,
            groups: 0,
        }
    }
}

/// Text the refine model sees for one survivor.
pub fn render(survivor: &Survivor) -> String {
    let mut out = format!(
        "FILE: {}\nEXPLANATION:\n{}\n",
        survivor.file,
        survivor.verdict.explanation.trim()
    );
    for snippet in survivor.verdict.snippets() {
        match snippet.lines {
            Some(range) => out.push_str(&format!("SNIPPET {}-{}\n", range.start, range.end)),
            None => out.push_str("SNIPPET\n"),
        }
        if !snippet.justification.is_empty() {
            out.push_str(&format!("WHY: {}\n", snippet.justification));
        }
        out.push_str("```\n");
        out.push_str(snippet.text.trim_end());
        out.push_str("\n```\n");
    }
    out
}

/// A refinement unit produced by [`collate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    /// Survivor indices whose rendered text fits the budget together.
    Batch(Vec<usize>),
    /// One survivor whose rendered text alone exceeds the budget.
    Oversized(usize),
}

/// Group rendered survivors, in order, so each batch stays within
/// `max_chars`. Oversized survivors come after every batch.
pub fn collate(rendered: &[String], max_chars: usize) -> Vec<Group> {
    let mut groups = Vec::new();
    let mut oversized = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_len = 0usize;

    for (i, text) in rendered.iter().enumerate() {
        if text.len() > max_chars {
            oversized.push(Group::Oversized(i));
            continue;
        }
        // One separator line between files.
        let added = text.len() + usize::from(!current.is_empty());
        if current_len + added > max_chars && !current.is_empty() {
            groups.push(Group::Batch(std::mem::take(&mut current)));
            current_len = 0;
        }
        current_len += text.len() + usize::from(!current.is_empty());
        current.push(i);
    }
    if !current.is_empty() {
        groups.push(Group::Batch(current));
    }
    groups.extend(oversized);
    groups
}

enum GroupResult {
    Ranked(Completion<Vec<RankedFile>>),
    Failed(EvaluationError),
    Cancelled,
}

/// Runs refinement under the pipeline's request limiter.
pub struct Refiner<'a> {
    pub evaluator: &'a StageEvaluator,
    pub limiter: &'a RequestLimiter,
    pub sink: &'a dyn DiagnosticSink,
    pub cancel: &'a CancellationToken,
}

impl Refiner<'_> {
    pub async fn refine(&self, mut survivors: Vec<Survivor>) -> Refinement {
        if survivors.is_empty() {
            return Refinement::unranked(survivors, RefinementState::Ranked);
        }

        let snippets_removed = {
            let mut verdicts: Vec<StageVerdict> =
                survivors.iter().map(|s| s.verdict.clone()).collect();
            let removed = dedup_snippets(&mut verdicts);
            for (survivor, verdict) in survivors.iter_mut().zip(verdicts) {
                survivor.verdict = verdict;
            }
            removed
        };

        let max_chars = self.evaluator.settings().max_refine_chars;
        let rendered: Vec<String> = survivors.iter().map(render).collect();
        let groups = collate(&rendered, max_chars);
        let count = groups.len();

        let calls = groups.iter().enumerate().map(|(i, group)| {
            let rendered = &rendered;
            let survivors = &survivors;
            async move {
                match group {
                    Group::Oversized(_) => None,
                    Group::Batch(members) => {
                        let text = members
                            .iter()
                            .map(|&m| rendered[m].as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                        let candidates: Vec<FileId> =
                            members.iter().map(|&m| survivors[m].file.clone()).collect();
                        Some(self.rank_group(i, count, &text, &candidates).await)
                    }
                }
            }
        });
        let results = join_all(calls).await;

        let mut slots: Vec<Option<Survivor>> = survivors.into_iter().map(Some).collect();
        let mut records = Vec::with_capacity(slots.len());
        let mut warnings = Vec::new();
        let mut degraded = false;
        let mut cancelled = false;

        for (group, result) in groups.iter().zip(results) {
            match (group, result) {
                (Group::Oversized(i), _) => {
                    if let Some(survivor) = slots[*i].take() {
                        let message = format!(
                            "{}: too large to refine ({} chars > {}), kept unranked",
                            survivor.file,
                            rendered[*i].len(),
                            max_chars
                        );
                        warn!("{}", message);
                        warnings.push(message);
                        records.push(FileRecord::unranked(survivor));
                    }
                }
                (Group::Batch(members), Some(GroupResult::Ranked(done))) => {
                    for entry in done.value {
                        let Some(slot) = members
                            .iter()
                            .find(|&&m| slots[m].as_ref().is_some_and(|s| s.file == entry.file))
                        else {
                            continue;
                        };
                        if let Some(survivor) = slots[*slot].take() {
                            records.push(FileRecord {
                                file: survivor.file,
                                verdict: survivor.verdict,
                                rank: Some(entry.rank),
                                why: entry.why,
                                refined: true,
                            });
                        }
                    }
                    for &m in members {
                        if let Some(survivor) = slots[m].take() {
                            records.push(FileRecord {
                                refined: true,
                                ..FileRecord::unranked(survivor)
                            });
                        }
                    }
                }
                (Group::Batch(members), other) => {
                    let message = match other {
                        Some(GroupResult::Failed(err)) => {
                            degraded = true;
                            format!(
                                "refinement failed for group {} ({} files): {}; kept full-source order",
                                group_label(members, &slots),
                                members.len(),
                                err
                            )
                        }
                        _ => {
                            cancelled = true;
                            format!(
                                "refinement cancelled for group {} ({} files); kept full-source order",
                                group_label(members, &slots),
                                members.len()
                            )
                        }
                    };
                    warn!("{}", message);
                    warnings.push(message);
                    for &m in members {
                        if let Some(survivor) = slots[m].take() {
                            records.push(FileRecord::unranked(survivor));
                        }
                    }
                }
            }
        }

        let state = if cancelled {
            RefinementState::Cancelled
        } else if degraded {
            RefinementState::Degraded
        } else {
            RefinementState::Ranked
        };
        Refinement {
            records,
            state,
            warnings,
            snippets_removed,
            groups: count,
        }
    }

    async fn rank_group(
        &self,
        index: usize,
        count: usize,
        text: &str,
        candidates: &[FileId],
    ) -> GroupResult {
        let subject = format!("group {} of {}", index + 1, count);
        let started = Instant::now();
        let Some(_permit) = self.limiter.acquire(self.cancel).await else {
            self.sink
                .emit(&DiagnosticEvent::new(Stage::Refine, subject, Outcome::Cancelled));
            return GroupResult::Cancelled;
        };

        let result = self.evaluator.rank_group(text, candidates).await;
        let mut event = DiagnosticEvent::new(Stage::Refine, subject, Outcome::Ranked);
        event.elapsed = started.elapsed();
        match result {
            Ok(done) => {
                event.cache = Some(done.cache);
                event.attempts = done.attempts;
                self.sink.emit(&event);
                GroupResult::Ranked(done)
            }
            Err(err) => {
                event.outcome = Outcome::Unranked;
                event.failure = Some(failure_label(&err));
                event.cache = Some(CacheStatus::Miss);
                event.attempts = err.attempts();
                self.sink.emit(&event);
                GroupResult::Failed(err)
            }
        }
    }
}

/// `model:<kind>`, `parse` or `source`.
pub fn failure_label(err: &EvaluationError) -> String {
    match err.kind() {
        Some(kind) => format!("{}:{}", err.class(), kind),
        None => err.class().to_string(),
    }
}

fn group_label(members: &[usize], slots: &[Option<Survivor>]) -> String {
    members
        .first()
        .and_then(|&m| slots[m].as_ref())
        .map(|s| format!("starting at {}", s.file))
        .unwrap_or_default()
}
