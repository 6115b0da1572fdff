//! Staged triage pipeline.
//!
//! Drives a file set through skeleton evaluation, full-source evaluation
//! and refinement. Every stage is a barrier: stage N+1 starts only after
//! stage N settled for every file still in the pool. Within a stage, files
//! run concurrently under one [`RequestLimiter`].
//!
//! # Status flow
//!
//! ```text
//! pending ─┬─ skeleton-pass ─┬─ full-pass ── refined
//!          │                 └─ full-fail
//!          ├─ skeleton-fail
//!          └─ (no grammar) ──── full-pass / full-fail
//! ```
//!
//! A failed evaluation moves the file to `stage-fail-by-error(stage)` and
//! lists it as inconclusive. It is never dropped silently and never counted
//! as relevant.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use llmap_core::model::{FailureKind, ModelClient};
use llmap_core::models::{FileId, FileStatus, Question, Stage, StageVerdict};
use llmap_core::skeleton::SkeletonRegistry;

use crate::cache::{CacheStatus, ResponseCache};
use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, NoDiagnostics, Outcome};
use crate::error::{EvaluationError, RunError};
use crate::evaluator::{Completion, EvaluatorSettings, StageEvaluator, StageOutcome};
use crate::input::{dedup, sample, FileUnit};
use crate::refine::{failure_label, FileRecord, Refinement, RefinementState, Refiner, Survivor};

/// Per-run options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Send every file straight to full-source evaluation.
    pub skip_skeleton: bool,
    /// Return full-source survivors in arrival order.
    pub skip_refine: bool,
    pub max_concurrent_requests: usize,
    /// Evaluate only this many files, chosen by `sample_seed`.
    pub sample_size: Option<usize>,
    /// Seed for sampling. A random seed is used when absent.
    pub sample_seed: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_skeleton: false,
            skip_refine: false,
            max_concurrent_requests: 200,
            sample_size: None,
            sample_seed: None,
        }
    }
}

/// Bounds the number of file tasks in flight across every stage.
#[derive(Clone)]
pub struct RequestLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl RequestLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot. Returns `None` once `cancel` fires; a cancelled
    /// run admits nothing new, even if a slot is free.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        }
    }
}

/// A file that produced no verdict at some stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InconclusiveFile {
    pub file: FileId,
    pub stage: Stage,
    /// `model`, `parse`, `source` or `cancelled`.
    pub class: String,
    pub kind: Option<FailureKind>,
    pub attempts: u32,
    pub reason: String,
}

impl InconclusiveFile {
    fn from_error(file: FileId, stage: Stage, err: &EvaluationError) -> Self {
        Self {
            file,
            stage,
            class: err.class().to_string(),
            kind: err.kind(),
            attempts: err.attempts(),
            reason: err.to_string(),
        }
    }

    fn cancelled(file: FileId, stage: Stage) -> Self {
        Self {
            file,
            stage,
            class: "cancelled".to_string(),
            kind: None,
            attempts: 0,
            reason: "run cancelled before evaluation".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub files: usize,
    pub skeleton_evaluated: usize,
    pub skeleton_not_applicable: usize,
    pub skeleton_rejected: usize,
    pub full_evaluated: usize,
    pub full_rejected: usize,
    pub inconclusive: usize,
    pub refine_groups: usize,
    pub snippets_deduplicated: usize,
    pub model_invocations: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub records: Vec<FileRecord>,
    pub inconclusive: Vec<InconclusiveFile>,
    /// Final status of every evaluated file, in input order.
    pub statuses: Vec<(FileId, FileStatus)>,
    pub warnings: Vec<String>,
    pub refinement: RefinementState,
    pub stats: RunStats,
    pub cancelled: bool,
}

impl PipelineResult {
    pub fn status_of(&self, file: &str) -> Option<FileStatus> {
        self.statuses
            .iter()
            .find(|(id, _)| id.as_str() == file)
            .map(|(_, s)| *s)
    }
}

/// Outcome of one file task at one stage.
enum TaskResult<T> {
    Done(Result<T, EvaluationError>),
    Cancelled,
}

/// Fills the diagnostic event for a successful evaluation.
trait Reported {
    fn report(&self, event: &mut DiagnosticEvent);
}

impl Reported for Completion<StageVerdict> {
    fn report(&self, event: &mut DiagnosticEvent) {
        event.outcome = if self.value.is_relevant() {
            Outcome::Relevant
        } else {
            Outcome::Irrelevant
        };
        event.cache = Some(self.cache);
        event.attempts = self.attempts;
    }
}

impl Reported for StageOutcome {
    fn report(&self, event: &mut DiagnosticEvent) {
        match self {
            StageOutcome::Verdict(done) => done.report(event),
            StageOutcome::NotApplicable => event.outcome = Outcome::NotApplicable,
        }
    }
}

/// Per-file state while a run is in progress.
struct Slot {
    unit: FileUnit,
    status: FileStatus,
    prior: Option<String>,
    verdict: Option<StageVerdict>,
}

pub struct Pipeline {
    client: Arc<dyn ModelClient>,
    cache: Arc<ResponseCache>,
    settings: EvaluatorSettings,
    skeletons: SkeletonRegistry,
    sink: Arc<dyn DiagnosticSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn ModelClient>,
        cache: Arc<ResponseCache>,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            client,
            cache,
            settings,
            skeletons: crate::skeleton::default_registry(),
            sink: Arc::new(NoDiagnostics),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_skeletons(mut self, skeletons: SkeletonRegistry) -> Self {
        self.skeletons = skeletons;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Triage `files` against `question`. Files repeating an earlier file's
    /// id are dropped with a warning.
    ///
    /// # Errors
    ///
    /// [`RunError::InvalidInput`] for an empty file set and
    /// [`RunError::InvalidTransition`] if a status would move backwards.
    /// Per-file failures are reported in the result, not as errors.
    pub async fn run(
        &self,
        files: Vec<FileUnit>,
        question: &Question,
        options: &PipelineOptions,
    ) -> Result<PipelineResult, RunError> {
        if files.is_empty() {
            return Err(RunError::InvalidInput("no input files".to_string()));
        }
        if question.as_str().trim().is_empty() {
            return Err(RunError::InvalidInput("the question is empty".to_string()));
        }

        let (files, mut warnings) = dedup(files);
        for duplicate in &warnings {
            warn!("{}", duplicate);
        }

        let files = match options.sample_size {
            Some(n) => {
                let seed = options
                    .sample_seed
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                info!(sample = n, seed = %seed, "Sampling input files");
                sample(files, n, &seed)
            }
            None => files,
        };
        if files.is_empty() {
            return Err(RunError::InvalidInput("sample size is zero".to_string()));
        }

        let evaluator = StageEvaluator::new(
            self.client.clone(),
            self.cache.clone(),
            self.skeletons.clone(),
            question.clone(),
            self.settings.clone(),
        );
        let limiter = RequestLimiter::new(options.max_concurrent_requests);

        let mut stats = RunStats {
            files: files.len(),
            ..RunStats::default()
        };
        let mut slots: Vec<Slot> = files
            .into_iter()
            .map(|unit| Slot {
                unit,
                status: FileStatus::Pending,
                prior: None,
                verdict: None,
            })
            .collect();
        let mut inconclusive = Vec::new();

        if !options.skip_skeleton {
            self.skeleton_stage(&evaluator, &limiter, &mut slots, &mut inconclusive, &mut stats)
                .await?;
        }

        let stage_two: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(i, _)| i)
            .collect();
        if self.cancel.is_cancelled() {
            for &i in &stage_two {
                let slot = &mut slots[i];
                slot.status = slot
                    .status
                    .advance(FileStatus::StageFailByError(Stage::FullSource))?;
                inconclusive.push(InconclusiveFile::cancelled(slot.unit.id().clone(), Stage::FullSource));
            }
        } else {
            self.full_source_stage(&evaluator, &limiter, &stage_two, &mut slots, &mut inconclusive, &mut stats)
                .await?;
        }

        let survivors: Vec<Survivor> = slots
            .iter()
            .filter(|s| s.status == FileStatus::FullPass)
            .filter_map(|s| {
                s.verdict.clone().map(|verdict| Survivor {
                    file: s.unit.id().clone(),
                    verdict,
                })
            })
            .collect();

        let refinement = if options.skip_refine {
            Refinement::unranked(survivors, RefinementState::Skipped)
        } else if self.cancel.is_cancelled() {
            Refinement::unranked(survivors, RefinementState::Cancelled)
        } else {
            Refiner {
                evaluator: &evaluator,
                limiter: &limiter,
                sink: self.sink.as_ref(),
                cancel: &self.cancel,
            }
            .refine(survivors)
            .await
        };

        let refined: Vec<usize> = {
            let positions: HashMap<&FileId, usize> = slots
                .iter()
                .enumerate()
                .map(|(i, s)| (s.unit.id(), i))
                .collect();
            refinement
                .records
                .iter()
                .filter(|r| r.refined)
                .filter_map(|r| positions.get(&r.file).copied())
                .collect()
        };
        for i in refined {
            let slot = &mut slots[i];
            slot.status = slot.status.advance(FileStatus::Refined)?;
        }

        warnings.extend(refinement.warnings);
        if let Some(degradation) = self.cache.degradation() {
            warnings.push(degradation.to_string());
        }

        stats.inconclusive = inconclusive.len();
        stats.refine_groups = refinement.groups;
        stats.snippets_deduplicated = refinement.snippets_removed;
        stats.model_invocations = evaluator.invocations();
        stats.cache_hits = evaluator.cache_hits();

        info!(
            files = stats.files,
            relevant = refinement.records.len(),
            inconclusive = stats.inconclusive,
            model_invocations = stats.model_invocations,
            cache_hits = stats.cache_hits,
            "Run complete"
        );

        Ok(PipelineResult {
            records: refinement.records,
            inconclusive,
            statuses: slots
                .into_iter()
                .map(|s| (s.unit.id().clone(), s.status))
                .collect(),
            warnings,
            refinement: refinement.state,
            stats,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    async fn skeleton_stage(
        &self,
        evaluator: &StageEvaluator,
        limiter: &RequestLimiter,
        slots: &mut [Slot],
        inconclusive: &mut Vec<InconclusiveFile>,
        stats: &mut RunStats,
    ) -> Result<(), RunError> {
        let mut submitted = Vec::new();
        for (i, slot) in slots.iter().enumerate() {
            if evaluator.has_skeleton_grammar(&slot.unit) {
                submitted.push(i);
            } else {
                stats.skeleton_not_applicable += 1;
                self.sink.emit(&DiagnosticEvent::new(
                    Stage::Skeleton,
                    slot.unit.id().as_str(),
                    Outcome::NotApplicable,
                ));
            }
        }
        debug!(files = submitted.len(), "Skeleton stage");

        let tasks = submitted.iter().map(|&i| {
            let unit = &slots[i].unit;
            self.run_task(limiter, unit, Stage::Skeleton, evaluator.evaluate_skeleton(unit))
        });
        let results = join_all(tasks).await;

        for (&i, result) in submitted.iter().zip(results) {
            let slot = &mut slots[i];
            let id = slot.unit.id().clone();
            match result {
                TaskResult::Done(Ok(StageOutcome::Verdict(done))) => {
                    stats.skeleton_evaluated += 1;
                    if done.value.is_relevant() {
                        slot.status = slot.status.advance(FileStatus::SkeletonPass)?;
                        let explanation = done.value.explanation.trim();
                        slot.prior = (!explanation.is_empty()).then(|| explanation.to_string());
                    } else {
                        stats.skeleton_rejected += 1;
                        slot.status = slot.status.advance(FileStatus::SkeletonFail)?;
                    }
                }
                TaskResult::Done(Ok(StageOutcome::NotApplicable)) => {
                    stats.skeleton_not_applicable += 1;
                }
                TaskResult::Done(Err(err)) => {
                    slot.status = slot
                        .status
                        .advance(FileStatus::StageFailByError(Stage::Skeleton))?;
                    inconclusive.push(InconclusiveFile::from_error(id, Stage::Skeleton, &err));
                }
                TaskResult::Cancelled => {
                    slot.status = slot
                        .status
                        .advance(FileStatus::StageFailByError(Stage::Skeleton))?;
                    inconclusive.push(InconclusiveFile::cancelled(id, Stage::Skeleton));
                }
            }
        }
        Ok(())
    }

    async fn full_source_stage(
        &self,
        evaluator: &StageEvaluator,
        limiter: &RequestLimiter,
        submitted: &[usize],
        slots: &mut [Slot],
        inconclusive: &mut Vec<InconclusiveFile>,
        stats: &mut RunStats,
    ) -> Result<(), RunError> {
        debug!(files = submitted.len(), "Full-source stage");
        let tasks = submitted.iter().map(|&i| {
            let slot = &slots[i];
            let evaluation = evaluator.evaluate_full_source(&slot.unit, slot.prior.as_deref());
            self.run_task(limiter, &slot.unit, Stage::FullSource, evaluation)
        });
        let results = join_all(tasks).await;

        for (&i, result) in submitted.iter().zip(results) {
            let slot = &mut slots[i];
            let id = slot.unit.id().clone();
            match result {
                TaskResult::Done(Ok(done)) => {
                    stats.full_evaluated += 1;
                    if done.value.is_relevant() {
                        slot.status = slot.status.advance(FileStatus::FullPass)?;
                        slot.verdict = Some(done.value);
                    } else {
                        stats.full_rejected += 1;
                        slot.status = slot.status.advance(FileStatus::FullFail)?;
                    }
                }
                TaskResult::Done(Err(err)) => {
                    slot.status = slot
                        .status
                        .advance(FileStatus::StageFailByError(Stage::FullSource))?;
                    inconclusive.push(InconclusiveFile::from_error(id, Stage::FullSource, &err));
                }
                TaskResult::Cancelled => {
                    slot.status = slot
                        .status
                        .advance(FileStatus::StageFailByError(Stage::FullSource))?;
                    inconclusive.push(InconclusiveFile::cancelled(id, Stage::FullSource));
                }
            }
        }
        Ok(())
    }

    /// One file at one stage: admission, evaluation, diagnostic event.
    /// The permit is held for the whole round trip; `evaluation` does not
    /// start until it is granted.
    async fn run_task<T: Reported>(
        &self,
        limiter: &RequestLimiter,
        unit: &FileUnit,
        stage: Stage,
        evaluation: impl Future<Output = Result<T, EvaluationError>>,
    ) -> TaskResult<T> {
        let started = Instant::now();
        let Some(_permit) = limiter.acquire(&self.cancel).await else {
            self.sink
                .emit(&DiagnosticEvent::new(stage, unit.id().as_str(), Outcome::Cancelled));
            return TaskResult::Cancelled;
        };

        let result = evaluation.await;

        let mut event = DiagnosticEvent::new(stage, unit.id().as_str(), Outcome::NotApplicable);
        event.elapsed = started.elapsed();
        match &result {
            Ok(done) => done.report(&mut event),
            Err(err) => {
                event.outcome = Outcome::Failed;
                event.failure = Some(failure_label(err));
                event.attempts = err.attempts();
                if !matches!(err, EvaluationError::Source(_)) {
                    event.cache = Some(CacheStatus::Miss);
                }
            }
        }
        self.sink.emit(&event);
        TaskResult::Done(result)
    }
}
