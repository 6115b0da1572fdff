//! Pipeline scenarios against a scripted model.
//!
//! The stub answers by stage (recognised from the system message) and by
//! file (the `FILE:` line that starts every file-specific message).

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llmap::cache::ResponseCache;
use llmap::client::ModelSelection;
use llmap::diagnostics::{MemoryDiagnostics, Outcome};
use llmap::error::RunError;
use llmap::evaluator::{EvaluatorSettings, RetryPolicy};
use llmap::input::FileUnit;
use llmap::pipeline::{Pipeline, PipelineOptions, PipelineResult};
use llmap::refine::RefinementState;
use llmap::skeleton::default_registry;
use llmap_core::cache::memory::InMemoryCacheStore;
use llmap_core::cache::{CacheEntry, CacheError, CacheMode, CacheStore};
use llmap_core::fingerprint::{CacheKey, Fingerprint};
use llmap_core::model::{FailureKind, ModelClient, ModelError, Prompt};
use llmap_core::models::{FileId, FileStatus, Question, Stage};
use llmap_core::skeleton::{truncate_lines, Extraction};
use tokio_util::sync::CancellationToken;

type Responder = dyn Fn(&str, &str, &Prompt) -> Result<String, FailureKind> + Send + Sync;

struct StubModel {
    respond: Box<Responder>,
    delay: Duration,
    calls: Mutex<Vec<(String, String)>>,
    prompts: Mutex<Vec<Prompt>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubModel {
    fn new(
        respond: impl Fn(&str, &str, &Prompt) -> Result<String, FailureKind> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_delay(respond, Duration::ZERO)
    }

    fn with_delay(
        respond: impl Fn(&str, &str, &Prompt) -> Result<String, FailureKind> + Send + Sync + 'static,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            delay,
            calls: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, stage: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(s, _)| s == stage)
            .map(|(_, f)| f)
            .collect()
    }

    fn refine_texts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| stage_of(p) == "refine")
            .map(|p| p.messages()[1].content.clone())
            .collect()
    }
}

fn stage_of(prompt: &Prompt) -> &'static str {
    let system = &prompt.messages()[0].content;
    if system.contains("You rank source files") {
        "refine"
    } else if system.contains("skeleton of one file") {
        "skeleton"
    } else {
        "full-source"
    }
}

fn file_of(prompt: &Prompt) -> String {
    prompt.messages()[1]
        .content
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("FILE: "))
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl ModelClient for StubModel {
    async fn invoke(&self, prompt: &Prompt, _model: &str, _timeout: Duration) -> Result<String, ModelError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let stage = stage_of(prompt);
        let file = file_of(prompt);
        self.calls.lock().unwrap().push((stage.to_string(), file.clone()));
        self.prompts.lock().unwrap().push(prompt.clone());
        let reply = (self.respond)(stage, &file, prompt);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply.map_err(|kind| ModelError::new(kind, "stubbed failure"))
    }
}

const QUESTION: &str = "Where is the database connection configured?";

const DB_SOURCE: &str = "package app.db;\n\
\n\
import java.sql.Connection;\n\
import java.sql.DriverManager;\n\
\n\
public class Database {\n\
    private final String url;\n\
\n\
    public Connection getConnection() throws Exception {\n\
        return DriverManager.getConnection(url);\n\
    }\n\
}\n";

const UTIL_SOURCE: &str = "package app.util;\n\
\n\
public class Strings {\n\
    public static boolean isBlank(String s) {\n\
        return s == null || s.trim().isEmpty();\n\
    }\n\
}\n";

const MODEL_SOURCE: &str = "package app.model;\n\
\n\
public class User {\n\
    private String name;\n\
\n\
    public String getName() {\n\
        return name;\n\
    }\n\
}\n";

fn java_files() -> Vec<FileUnit> {
    vec![
        FileUnit::inline("src/app/db/Database.java", DB_SOURCE),
        FileUnit::inline("src/app/util/Strings.java", UTIL_SOURCE),
        FileUnit::inline("src/app/model/User.java", MODEL_SOURCE),
    ]
}

fn relevant_with_snippet(explanation: &str, code: &str) -> String {
    format!(
        "VERDICT: RELEVANT\nSCORE: 8\nEXPLANATION:\n{}\nSNIPPET 9-11\nWHY: opens the connection\n```java\n{}\n```\n",
        explanation, code
    )
}

/// Relevant exactly when the shown text mentions `getConnection`; ranks
/// every listed file in the order it appears.
fn connection_model() -> Arc<StubModel> {
    StubModel::new(|stage, _file, prompt| {
        let user = &prompt.messages()[1].content;
        match stage {
            "refine" => Ok(user
                .lines()
                .filter_map(|l| l.strip_prefix("FILE: "))
                .enumerate()
                .map(|(i, f)| format!("RANK {}: {}\nWHY: uses the connection\n", i + 1, f))
                .collect()),
            "skeleton" if user.contains("getConnection") => {
                Ok("VERDICT: RELEVANT\nEXPLANATION: declares getConnection".to_string())
            }
            "skeleton" => Ok("VERDICT: IRRELEVANT\nEXPLANATION: no database code".to_string()),
            _ if user.contains("getConnection") => Ok(relevant_with_snippet(
                "Builds the JDBC connection from the configured URL.",
                "return DriverManager.getConnection(url);",
            )),
            _ => Ok("VERDICT: IRRELEVANT\nEXPLANATION: unrelated".to_string()),
        }
    })
}

fn settings() -> EvaluatorSettings {
    EvaluatorSettings {
        models: ModelSelection {
            analyze: "analyze-model".into(),
            refine: "refine-model".into(),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
        timeout: Duration::from_secs(5),
        max_skeleton_chars: 100_000,
        max_chunk_chars: 100_000,
        max_refine_chars: 100_000,
    }
}

fn pipeline(
    model: Arc<StubModel>,
    store: Arc<dyn CacheStore>,
    mode: CacheMode,
    sink: Arc<MemoryDiagnostics>,
) -> Pipeline {
    Pipeline::new(model, Arc::new(ResponseCache::new(store, mode)), settings()).with_sink(sink)
}

async fn run_once(
    model: Arc<StubModel>,
    store: Arc<dyn CacheStore>,
    files: Vec<FileUnit>,
    options: PipelineOptions,
) -> (PipelineResult, Arc<MemoryDiagnostics>) {
    let sink = Arc::new(MemoryDiagnostics::new());
    let result = pipeline(model, store, CacheMode::ReadWrite, sink.clone())
        .run(files, &Question::new(QUESTION), &options)
        .await
        .unwrap();
    (result, sink)
}

fn record_paths(result: &PipelineResult) -> Vec<&str> {
    result.records.iter().map(|r| r.file.as_str()).collect()
}

#[tokio::test]
async fn test_skeleton_stage_selects_connection_file() {
    let model = connection_model();
    let (result, sink) = run_once(
        model.clone(),
        Arc::new(InMemoryCacheStore::new()),
        java_files(),
        PipelineOptions::default(),
    )
    .await;

    let relevant: Vec<String> = sink
        .for_stage(Stage::Skeleton)
        .into_iter()
        .filter(|e| e.outcome == Outcome::Relevant)
        .map(|e| e.subject)
        .collect();
    assert_eq!(relevant, vec!["src/app/db/Database.java"]);

    assert_eq!(record_paths(&result), vec!["src/app/db/Database.java"]);
    let record = &result.records[0];
    assert_eq!(record.rank, Some(1));
    assert_eq!(record.verdict.snippets().len(), 1);
    assert_eq!(result.status_of("src/app/db/Database.java"), Some(FileStatus::Refined));
    assert_eq!(result.status_of("src/app/util/Strings.java"), Some(FileStatus::SkeletonFail));
    assert_eq!(result.refinement, RefinementState::Ranked);
    assert!(result.inconclusive.is_empty());
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn test_skeleton_rejects_never_reach_later_stages() {
    let model = connection_model();
    run_once(
        model.clone(),
        Arc::new(InMemoryCacheStore::new()),
        java_files(),
        PipelineOptions::default(),
    )
    .await;

    assert_eq!(model.calls_for("skeleton").len(), 3);
    assert_eq!(model.calls_for("full-source"), vec!["src/app/db/Database.java"]);
    for text in model.refine_texts() {
        assert!(!text.contains("Strings.java"));
        assert!(!text.contains("User.java"));
    }
}

#[tokio::test]
async fn test_repeated_file_is_evaluated_once() {
    let model = connection_model();
    let mut files = java_files();
    files.push(FileUnit::inline("src/app/db/Database.java", DB_SOURCE));

    let (result, _) = run_once(
        model.clone(),
        Arc::new(InMemoryCacheStore::new()),
        files,
        PipelineOptions::default(),
    )
    .await;

    assert_eq!(record_paths(&result), vec!["src/app/db/Database.java"]);
    assert_eq!(result.status_of("src/app/db/Database.java"), Some(FileStatus::Refined));
    assert_eq!(result.statuses.len(), 3);
    assert_eq!(result.stats.files, 3);
    assert_eq!(model.calls_for("full-source"), vec!["src/app/db/Database.java"]);
    assert_eq!(
        result.warnings,
        vec!["Duplicate file ignored: src/app/db/Database.java".to_string()]
    );
}

#[tokio::test]
async fn test_new_chunk_budget_reevaluates_cached_file() {
    let source = "aaaaaaaa0\naaaaaaaa1\naaaaaaaa2\naaaaaaaa3\n";
    let files = || vec![FileUnit::inline("src/Lines.java", source)];
    let options = PipelineOptions {
        skip_skeleton: true,
        skip_refine: true,
        ..PipelineOptions::default()
    };
    let model = StubModel::new(|_, _, _| Ok("VERDICT: IRRELEVANT\nEXPLANATION: filler".to_string()));
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());

    for (budget, expected_calls) in [(20, 2), (30, 4), (20, 4)] {
        let mut tuned = settings();
        tuned.max_chunk_chars = budget;
        let cache = Arc::new(ResponseCache::new(store.clone(), CacheMode::ReadWrite));
        Pipeline::new(model.clone(), cache, tuned)
            .run(files(), &Question::new(QUESTION), &options)
            .await
            .unwrap();
        assert_eq!(model.calls().len(), expected_calls, "budget {}", budget);
    }
}

#[tokio::test]
async fn test_failure_record_in_cache_is_reattempted() {
    let question = Question::new(QUESTION);
    let id = FileId::new("src/app/db/Database.java");
    let skeleton = match default_registry().extract(Some("java"), DB_SOURCE) {
        Extraction::Skeleton(text) => truncate_lines(&text, settings().max_skeleton_chars),
        Extraction::Unsupported => panic!("Database.java has a skeleton"),
    };
    let key = CacheKey::new(
        &question,
        Stage::Skeleton,
        "analyze-model",
        &Fingerprint::of_file(&id, DB_SOURCE).for_skeleton(&skeleton),
    );
    let store = Arc::new(InMemoryCacheStore::new());
    store.seed(key.clone(), "ERROR: request failed after 10 attempts");

    let model = connection_model();
    let (result, _) = run_once(model.clone(), store.clone(), java_files(), PipelineOptions::default()).await;

    assert!(model.calls_for("skeleton").contains(&id.to_string()));
    assert_eq!(record_paths(&result), vec![id.as_str()]);
    let entry = store.get(&key).await.unwrap().unwrap();
    assert!(entry.response.starts_with("VERDICT: RELEVANT"));
}

#[tokio::test]
async fn test_skip_skeleton_emits_no_skeleton_events() {
    let model = connection_model();
    let options = PipelineOptions {
        skip_skeleton: true,
        ..PipelineOptions::default()
    };
    let (result, sink) = run_once(model.clone(), Arc::new(InMemoryCacheStore::new()), java_files(), options).await;

    assert!(sink.for_stage(Stage::Skeleton).is_empty());
    assert!(model.calls_for("skeleton").is_empty());
    assert_eq!(model.calls_for("full-source").len(), 3);
    assert_eq!(result.status_of("src/app/util/Strings.java"), Some(FileStatus::FullFail));
    assert_eq!(record_paths(&result), vec!["src/app/db/Database.java"]);
}

#[tokio::test]
async fn test_refinement_failure_keeps_unranked_survivors() {
    let model = StubModel::new(|stage, file, _| match stage {
        "refine" => Err(FailureKind::Rejected),
        "skeleton" => Ok("VERDICT: RELEVANT\nEXPLANATION: maybe".to_string()),
        _ => Ok(relevant_with_snippet(
            &format!("{} touches configuration", file),
            &format!("// {}", file),
        )),
    });
    let (result, sink) = run_once(model, Arc::new(InMemoryCacheStore::new()), java_files(), PipelineOptions::default()).await;

    assert_eq!(
        record_paths(&result),
        vec![
            "src/app/db/Database.java",
            "src/app/util/Strings.java",
            "src/app/model/User.java"
        ]
    );
    assert!(result.records.iter().all(|r| r.rank.is_none()));
    assert_eq!(result.refinement, RefinementState::Degraded);
    assert!(result.warnings.iter().any(|w| w.contains("refinement failed")));
    assert_eq!(result.status_of("src/app/model/User.java"), Some(FileStatus::FullPass));

    let refine_events = sink.for_stage(Stage::Refine);
    assert_eq!(refine_events.len(), 1);
    assert_eq!(refine_events[0].outcome, Outcome::Unranked);
    assert_eq!(refine_events[0].failure.as_deref(), Some("model:rejected"));
}

#[tokio::test]
async fn test_unlisted_survivors_are_appended() {
    let model = StubModel::new(|stage, _, _| match stage {
        "refine" => Ok("RANK 1: src/app/model/User.java\nWHY: best".to_string()),
        "skeleton" => Ok("VERDICT: RELEVANT\nEXPLANATION: maybe".to_string()),
        _ => Ok("VERDICT: RELEVANT\nEXPLANATION: configures something".to_string()),
    });
    let (result, _) = run_once(model, Arc::new(InMemoryCacheStore::new()), java_files(), PipelineOptions::default()).await;

    assert_eq!(
        record_paths(&result),
        vec![
            "src/app/model/User.java",
            "src/app/db/Database.java",
            "src/app/util/Strings.java"
        ]
    );
    assert_eq!(result.records[0].why.as_deref(), Some("best"));
    assert_eq!(result.records[1].rank, None);
    assert!(result
        .statuses
        .iter()
        .all(|(_, status)| *status == FileStatus::Refined));
}

#[tokio::test]
async fn test_duplicate_snippets_removed_before_refinement() {
    let model = StubModel::new(|stage, _, _| match stage {
        "refine" => Ok("RANK 1: src/app/db/Database.java".to_string()),
        "skeleton" => Ok("VERDICT: RELEVANT\nEXPLANATION: maybe".to_string()),
        _ => Ok(relevant_with_snippet("shares the helper", "return DataSources.open();")),
    });
    let (result, _) = run_once(model.clone(), Arc::new(InMemoryCacheStore::new()), java_files(), PipelineOptions::default()).await;

    assert_eq!(result.records.len(), 3);
    let with_snippets = result
        .records
        .iter()
        .filter(|r| !r.verdict.snippets().is_empty())
        .count();
    assert_eq!(with_snippets, 1);
    assert_eq!(result.stats.snippets_deduplicated, 2);
    assert!(result.records.iter().all(|r| r.verdict.explanation == "shares the helper"));

    let texts = model.refine_texts();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].matches("return DataSources.open();").count(), 1);
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());

    let first_model = connection_model();
    let (first, _) = run_once(first_model.clone(), store.clone(), java_files(), PipelineOptions::default()).await;
    assert!(first.stats.model_invocations > 0);

    let second_model = connection_model();
    let (second, _) = run_once(second_model.clone(), store, java_files(), PipelineOptions::default()).await;

    assert!(second_model.calls().is_empty());
    assert_eq!(second.stats.model_invocations, 0);
    assert_eq!(second.records, first.records);
    assert_eq!(second.statuses, first.statuses);
    assert_eq!(second.inconclusive, first.inconclusive);
    assert_eq!(second.refinement, first.refinement);
}

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let model = StubModel::with_delay(
        |stage, _, _| match stage {
            "refine" => Ok("RANK 1: none".to_string()),
            _ => Ok("VERDICT: RELEVANT\nEXPLANATION: yes".to_string()),
        },
        Duration::from_millis(20),
    );
    let files: Vec<FileUnit> = (0..12)
        .map(|i| FileUnit::inline(&format!("src/F{}.java", i), format!("class F{} {{ void run() {{}} }}", i)))
        .collect();
    let options = PipelineOptions {
        max_concurrent_requests: 3,
        ..PipelineOptions::default()
    };
    let (result, _) = run_once(model.clone(), Arc::new(InMemoryCacheStore::new()), files, options).await;

    let max = model.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "max in flight was {}", max);
    assert!(max >= 2, "requests never overlapped");
    assert_eq!(result.records.len(), 12);
}

#[tokio::test]
async fn test_files_without_grammar_go_to_full_source() {
    let model = StubModel::new(|stage, _, _| match stage {
        "skeleton" => Ok("VERDICT: IRRELEVANT\nEXPLANATION: no".to_string()),
        "refine" => Ok("RANK 1: build.gradle".to_string()),
        _ => Ok("VERDICT: RELEVANT\nEXPLANATION: sets the JDBC URL".to_string()),
    });
    let files = vec![
        FileUnit::inline("build.gradle", "jdbcUrl = 'jdbc:postgresql://db/app'"),
        FileUnit::inline("src/Empty.java", "// nothing here yet\n"),
        FileUnit::inline("src/Other.java", "class Other { void run() {} }"),
    ];
    let (result, sink) = run_once(model.clone(), Arc::new(InMemoryCacheStore::new()), files, PipelineOptions::default()).await;

    let not_applicable: Vec<String> = sink
        .for_stage(Stage::Skeleton)
        .into_iter()
        .filter(|e| e.outcome == Outcome::NotApplicable)
        .map(|e| e.subject)
        .collect();
    assert_eq!(not_applicable, vec!["build.gradle", "src/Empty.java"]);
    assert_eq!(model.calls_for("skeleton"), vec!["src/Other.java"]);
    assert_eq!(model.calls_for("full-source").len(), 2);
    assert_eq!(result.status_of("src/Other.java"), Some(FileStatus::SkeletonFail));
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.stats.skeleton_not_applicable, 2);
}

#[tokio::test]
async fn test_failed_evaluations_are_inconclusive() {
    let model = StubModel::new(|stage, file, _| match stage {
        "skeleton" => Ok("VERDICT: RELEVANT\nEXPLANATION: maybe".to_string()),
        "refine" => Ok("RANK 1: src/app/db/Database.java".to_string()),
        _ if file.ends_with("User.java") => Err(FailureKind::Transient),
        _ if file.ends_with("Strings.java") => Ok("I think this is probably fine.".to_string()),
        _ => Ok("VERDICT: RELEVANT\nEXPLANATION: opens it".to_string()),
    });
    let (result, sink) = run_once(model.clone(), Arc::new(InMemoryCacheStore::new()), java_files(), PipelineOptions::default()).await;

    assert_eq!(record_paths(&result), vec!["src/app/db/Database.java"]);
    assert_eq!(result.inconclusive.len(), 2);
    let user = result
        .inconclusive
        .iter()
        .find(|f| f.file.as_str().ends_with("User.java"))
        .unwrap();
    assert_eq!(user.class, "model");
    assert_eq!(user.kind, Some(FailureKind::Transient));
    assert_eq!(user.attempts, 3);
    let strings = result
        .inconclusive
        .iter()
        .find(|f| f.file.as_str().ends_with("Strings.java"))
        .unwrap();
    assert_eq!(strings.class, "parse");
    assert_eq!(
        result.status_of("src/app/model/User.java"),
        Some(FileStatus::StageFailByError(Stage::FullSource))
    );

    let failed = sink
        .for_stage(Stage::FullSource)
        .into_iter()
        .filter(|e| e.outcome == Outcome::Failed)
        .count();
    assert_eq!(failed, 2);
    assert_eq!(model.calls_for("full-source").iter().filter(|f| f.ends_with("User.java")).count(), 3);
}

#[tokio::test]
async fn test_unreadable_source_is_inconclusive() {
    let model = connection_model();
    let mut files = java_files();
    files.push(FileUnit::from_path("/definitely/missing/Gone.java"));
    let (result, _) = run_once(model, Arc::new(InMemoryCacheStore::new()), files, PipelineOptions::default()).await;

    let gone = result
        .inconclusive
        .iter()
        .find(|f| f.file.as_str().ends_with("Gone.java"))
        .unwrap();
    assert_eq!(gone.class, "source");
    assert_eq!(gone.stage, Stage::Skeleton);
    assert_eq!(record_paths(&result), vec!["src/app/db/Database.java"]);
}

#[tokio::test]
async fn test_write_only_recomputes_and_refreshes() {
    let store = Arc::new(InMemoryCacheStore::new());
    run_once(connection_model(), store.clone(), java_files(), PipelineOptions::default()).await;
    let entries = store.len();

    let model = connection_model();
    let sink = Arc::new(MemoryDiagnostics::new());
    let result = pipeline(model.clone(), store.clone(), CacheMode::WriteOnly, sink)
        .run(java_files(), &Question::new(QUESTION), &PipelineOptions::default())
        .await
        .unwrap();

    assert_eq!(model.calls_for("skeleton").len(), 3);
    assert_eq!(result.stats.cache_hits, 0);
    assert_eq!(store.len(), entries);
}

#[tokio::test]
async fn test_read_only_never_writes() {
    let store = Arc::new(InMemoryCacheStore::new());
    let model = connection_model();
    let sink = Arc::new(MemoryDiagnostics::new());
    pipeline(model, store.clone(), CacheMode::ReadOnly, sink)
        .run(java_files(), &Question::new(QUESTION), &PipelineOptions::default())
        .await
        .unwrap();
    assert!(store.is_empty());
}

struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Err(CacheError::Unavailable("database is locked".into()))
    }
    async fn put(&self, _key: &CacheKey, _response: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("database is locked".into()))
    }
    async fn discard(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("database is locked".into()))
    }
}

#[tokio::test]
async fn test_unavailable_cache_degrades_without_failing() {
    let (result, _) = run_once(connection_model(), Arc::new(BrokenStore), java_files(), PipelineOptions::default()).await;

    assert_eq!(record_paths(&result), vec!["src/app/db/Database.java"]);
    let cache_warnings: Vec<&String> = result
        .warnings
        .iter()
        .filter(|w| w.contains("cache disabled"))
        .collect();
    assert_eq!(cache_warnings.len(), 1);
    assert!(cache_warnings[0].contains("database is locked"));
}

#[tokio::test]
async fn test_cancelled_run_admits_nothing() {
    let model = connection_model();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let sink = Arc::new(MemoryDiagnostics::new());
    let result = pipeline(model.clone(), Arc::new(InMemoryCacheStore::new()), CacheMode::ReadWrite, sink)
        .with_cancellation(cancel)
        .run(java_files(), &Question::new(QUESTION), &PipelineOptions::default())
        .await
        .unwrap();

    assert!(model.calls().is_empty());
    assert!(result.cancelled);
    assert!(result.records.is_empty());
    assert_eq!(result.inconclusive.len(), 3);
    assert!(result.inconclusive.iter().all(|f| f.class == "cancelled"));
    assert_eq!(result.refinement, RefinementState::Cancelled);
}

#[tokio::test]
async fn test_sampling_is_reproducible() {
    let files = || -> Vec<FileUnit> {
        (0..10)
            .map(|i| FileUnit::inline(&format!("src/S{}.py", i), "def run():\n    pass\n"))
            .collect()
    };
    let options = PipelineOptions {
        sample_size: Some(4),
        sample_seed: Some("fixed".into()),
        skip_refine: true,
        ..PipelineOptions::default()
    };
    let always = |_: &str, _: &str, _: &Prompt| {
        Ok::<_, FailureKind>("VERDICT: RELEVANT\nEXPLANATION: yes".to_string())
    };

    let (a, _) = run_once(StubModel::new(always), Arc::new(InMemoryCacheStore::new()), files(), options.clone()).await;
    let (b, _) = run_once(StubModel::new(always), Arc::new(InMemoryCacheStore::new()), files(), options).await;

    assert_eq!(a.stats.files, 4);
    assert_eq!(record_paths(&a), record_paths(&b));
    assert_eq!(a.refinement, RefinementState::Skipped);
}

#[tokio::test]
async fn test_empty_input_is_rejected() {
    let sink = Arc::new(MemoryDiagnostics::new());
    let err = pipeline(connection_model(), Arc::new(InMemoryCacheStore::new()), CacheMode::ReadWrite, sink)
        .run(Vec::new(), &Question::new(QUESTION), &PipelineOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::InvalidInput(_)));
}
