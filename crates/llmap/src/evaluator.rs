//! Stage evaluation: one file at one stage, through the cache, the model
//! capability and the response grammar.
//!
//! # Flow
//!
//! 1. Look the cache key up. A hit that parses is returned as is. A hit
//!    that no longer parses is discarded and treated as a miss.
//! 2. On a miss, invoke the model under the [`RetryPolicy`].
//! 3. Parse the reply. A reply that does not parse gets one corrective
//!    follow-up before the evaluation fails with a parse error.
//! 4. Store the reply that parsed (mode permitting).
//!
//! Stage 2 splits oversized sources into chunks. Every chunk goes through
//! the flow above under its own key and the chunk verdicts are combined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use llmap_core::chunk::chunk_lines;
use llmap_core::fingerprint::{CacheKey, Fingerprint};
use llmap_core::model::{FailureKind, ModelClient, ModelError, Prompt};
use llmap_core::models::{FileId, Question, Stage, StageVerdict};
use llmap_core::ranking::{parse_ranking, RankedFile};
use llmap_core::skeleton::{truncate_lines, Extraction, SkeletonRegistry};
use llmap_core::verdict::parse_verdict;

use crate::cache::{CacheStatus, Lookup, ResponseCache};
use crate::client::ModelSelection;
use crate::config::Config;
use crate::error::EvaluationError;
use crate::input::FileUnit;
use crate::prompts;

/// Retry budget and backoff for model invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per invocation, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based): `base * 2^(attempt-1)`, exponent capped at 5.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(5);
        self.backoff_base * (1u32 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base: Duration::from_millis(1000),
        }
    }
}

/// Everything an evaluator needs besides the question.
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub models: ModelSelection,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub max_skeleton_chars: usize,
    pub max_chunk_chars: usize,
    pub max_refine_chars: usize,
}

impl EvaluatorSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            models: ModelSelection::from_config(&config.model)?,
            retry: RetryPolicy {
                max_attempts: config.pipeline.max_attempts,
                backoff_base: Duration::from_millis(config.pipeline.backoff_base_ms),
            },
            timeout: Duration::from_secs(config.model.timeout_secs),
            max_skeleton_chars: config.pipeline.max_skeleton_chars,
            max_chunk_chars: config.pipeline.max_chunk_chars,
            max_refine_chars: config.pipeline.max_refine_chars,
        })
    }
}

/// A parsed result plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<T> {
    pub value: T,
    pub cache: CacheStatus,
    /// Model invocations made for this result (0 on a cache hit).
    pub attempts: u32,
}

/// Result of [`StageEvaluator::evaluate_skeleton`].
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Verdict(Completion<StageVerdict>),
    /// The stage does not apply to this file (no usable skeleton).
    NotApplicable,
}

/// Evaluates files for one question.
pub struct StageEvaluator {
    client: Arc<dyn ModelClient>,
    cache: Arc<ResponseCache>,
    skeletons: SkeletonRegistry,
    question: Question,
    settings: EvaluatorSettings,
    invocations: AtomicU64,
    cache_hits: AtomicU64,
}

impl StageEvaluator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        cache: Arc<ResponseCache>,
        skeletons: SkeletonRegistry,
        question: Question,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            client,
            cache,
            skeletons,
            question,
            settings,
            invocations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn question(&self) -> &Question {
        &self.question
    }

    pub fn settings(&self) -> &EvaluatorSettings {
        &self.settings
    }

    /// Model invocations made so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// `true` when `file` has a registered skeleton grammar.
    pub fn has_skeleton_grammar(&self, file: &FileUnit) -> bool {
        file.language().is_some_and(|l| self.skeletons.supports(l))
    }

    /// Evaluate `file` from its skeleton.
    ///
    /// Files with no grammar, or whose skeleton comes out empty, are
    /// [`StageOutcome::NotApplicable`] and go on to the full-source stage.
    pub async fn evaluate_skeleton(&self, file: &FileUnit) -> Result<StageOutcome, EvaluationError> {
        let source = file.load().await?;
        let skeleton = match self.skeletons.extract(file.language(), &source) {
            Extraction::Skeleton(s) => s,
            Extraction::Unsupported => return Ok(StageOutcome::NotApplicable),
        };
        let skeleton = truncate_lines(&skeleton, self.settings.max_skeleton_chars);
        let fingerprint = Fingerprint::of_file(file.id(), &source).for_skeleton(&skeleton);

        let model = self.settings.models.analyze.as_str();
        let key = CacheKey::new(&self.question, Stage::Skeleton, model, &fingerprint);
        let prompt = prompts::skeleton_prompt(&self.question, file.id(), &skeleton);
        let completion = self
            .complete(&key, &prompt, model, |text| parse_verdict(text).map_err(|e| e.to_string()))
            .await?;
        Ok(StageOutcome::Verdict(completion))
    }

    /// Evaluate `file` from its full source, one model call per chunk.
    ///
    /// `prior` is the skeleton-stage explanation, passed to the prompt as
    /// context.
    pub async fn evaluate_full_source(
        &self,
        file: &FileUnit,
        prior: Option<&str>,
    ) -> Result<Completion<StageVerdict>, EvaluationError> {
        let source = file.load().await?;
        let fingerprint = Fingerprint::of_file(file.id(), &source);
        let id = file.id();
        let model = self.settings.models.analyze.as_str();
        let chunks = chunk_lines(&source, self.settings.max_chunk_chars);
        let count = chunks.len();

        let mut verdicts = Vec::with_capacity(count);
        let mut attempts = 0;
        let mut all_hit = true;
        for chunk in &chunks {
            let key = CacheKey::new(
                &self.question,
                Stage::FullSource,
                model,
                &fingerprint.for_chunk(chunk, count),
            );
            let prompt = prompts::full_source_prompt(&self.question, id, chunk, count, prior);
            let done = self
                .complete(&key, &prompt, model, |text| parse_verdict(text).map_err(|e| e.to_string()))
                .await?;
            attempts += done.attempts;
            all_hit &= done.cache == CacheStatus::Hit;
            verdicts.push((done.cache, done.value));
        }

        let cache = if all_hit {
            CacheStatus::Hit
        } else {
            verdicts
                .iter()
                .map(|(c, _)| *c)
                .find(|c| *c != CacheStatus::Hit)
                .unwrap_or(CacheStatus::Miss)
        };
        Ok(Completion {
            value: StageVerdict::combine(verdicts.into_iter().map(|(_, v)| v).collect()),
            cache,
            attempts,
        })
    }

    /// Rank one refinement group. `combined` is the group's rendered text
    /// and `candidates` its files.
    pub async fn rank_group(
        &self,
        combined: &str,
        candidates: &[FileId],
    ) -> Result<Completion<Vec<RankedFile>>, EvaluationError> {
        let model = self.settings.models.refine.as_str();
        let key = CacheKey::new(
            &self.question,
            Stage::Refine,
            model,
            &Fingerprint::of_text(combined),
        );
        let prompt = prompts::refine_prompt(&self.question, combined);
        self.complete(&key, &prompt, model, |text| {
            parse_ranking(text, candidates).map_err(|e| e.to_string())
        })
        .await
    }

    /// Cache lookup, model call, parse, corrective follow-up, cache store.
    async fn complete<T>(
        &self,
        key: &CacheKey,
        prompt: &Prompt,
        model: &str,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Result<Completion<T>, EvaluationError> {
        let lookup = self.cache.lookup(key).await;
        let mut status = lookup.status();
        if let Lookup::Hit(text) = lookup {
            match parse(&text) {
                Ok(value) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Completion {
                        value,
                        cache: CacheStatus::Hit,
                        attempts: 0,
                    });
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding cached response that no longer parses");
                    self.cache.discard(key).await;
                    status = CacheStatus::Miss;
                }
            }
        }

        let (reply, mut attempts) = self.invoke_with_retry(prompt, model).await?;
        let (reply, value) = match parse(&reply) {
            Ok(value) => (reply, value),
            Err(first_error) => {
                debug!(key = %key, error = %first_error, "Reply did not parse, asking for a correction");
                let follow_up =
                    prompt.with_follow_up(&reply, prompts::format_correction(&first_error));
                let (second, more) = self
                    .invoke_with_retry(&follow_up, model)
                    .await
                    .map_err(|e| add_attempts(e, attempts))?;
                attempts += more;
                match parse(&second) {
                    Ok(value) => (second, value),
                    Err(e) => {
                        return Err(EvaluationError::Parse {
                            attempts,
                            message: e,
                        })
                    }
                }
            }
        };

        self.cache.store(key, &reply).await;
        Ok(Completion {
            value,
            cache: status,
            attempts,
        })
    }

    /// Invoke the model until it answers or the retry policy gives up.
    /// Returns the reply and the number of attempts made.
    async fn invoke_with_retry(
        &self,
        prompt: &Prompt,
        model: &str,
    ) -> Result<(String, u32), EvaluationError> {
        let policy = self.settings.retry;
        let timeout = self.settings.timeout;
        let mut current = prompt.clone();
        let mut corrected = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.invocations.fetch_add(1, Ordering::Relaxed);
            let result = match tokio::time::timeout(timeout, self.client.invoke(&current, model, timeout)).await
            {
                Ok(result) => result,
                Err(_) => Err(ModelError::new(
                    FailureKind::Timeout,
                    format!("no response within {}s", timeout.as_secs_f64()),
                )),
            };

            let err = match result {
                Ok(text) => return Ok((text, attempt)),
                Err(err) => err,
            };

            let retry = attempt < policy.max_attempts
                && match err.kind {
                    FailureKind::RateLimited | FailureKind::Transient | FailureKind::Timeout => true,
                    FailureKind::Malformed => !corrected,
                    FailureKind::Rejected => false,
                };
            if !retry {
                return Err(EvaluationError::Model {
                    kind: err.kind,
                    attempts: attempt,
                    message: err.message,
                });
            }

            debug!(model, attempt, kind = err.kind.as_str(), error = %err.message, "Retrying model call");
            match err.kind {
                FailureKind::RateLimited | FailureKind::Transient => {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
                FailureKind::Malformed => {
                    corrected = true;
                    current = prompt.with_correction(prompts::empty_reply_correction());
                }
                _ => {}
            }
        }
    }
}

fn add_attempts(err: EvaluationError, earlier: u32) -> EvaluationError {
    match err {
        EvaluationError::Model {
            kind,
            attempts,
            message,
        } => EvaluationError::Model {
            kind,
            attempts: attempts + earlier,
            message,
        },
        other => other,
    }
}
