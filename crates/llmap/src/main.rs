//! # llmap CLI
//!
//! Reads file paths from stdin, one per line, and prints the files that
//! matter for a question, with explanations and code snippets.
//!
//! ## Usage
//!
//! ```bash
//! find src -name '*.java' | llmap run "Where is the database connection configured?"
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `llmap run "<question>"` | Triage paths read from stdin |
//! | `llmap skeleton <files…>` | Print the skeleton of each file |
//! | `llmap init` | Create the cache database and schema |
//!
//! Results go to stdout. Warnings, inconclusive files and diagnostics go
//! to stderr. Set `LLMAP_LOG` (e.g. `LLMAP_LOG=debug`) to change the log
//! level.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use llmap::cache::ResponseCache;
use llmap::client::ChatClient;
use llmap::config::{self, Config};
use llmap::diagnostics::DiagnosticsMode;
use llmap::error::RunError;
use llmap::evaluator::EvaluatorSettings;
use llmap::input::read_paths;
use llmap::migrate;
use llmap::output::{self, OutputFormat};
use llmap::pipeline::{Pipeline, PipelineOptions};
use llmap::skeleton::{default_registry, language_for_path, Extraction};
use llmap::sqlite_cache::SqliteCacheStore;
use llmap_core::cache::{CacheError, CacheMode};
use llmap_core::models::Question;

/// llmap: find the source files that answer a question.
#[derive(Parser)]
#[command(
    name = "llmap",
    about = "llmap: staged LLM relevance triage of source files",
    version,
    long_about = "llmap asks a language model which of the given source files are relevant to a \
    question. Files are filtered in stages (skeleton, full source, refinement) and every model \
    response is cached, so reruns are cheap and interrupted runs resume where they stopped."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./llmap.toml` when it exists, otherwise built-in
    /// defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Triage the paths read from stdin against a question.
    Run {
        /// The question to answer.
        question: String,

        /// Evaluate only a random sample of this many files.
        #[arg(long)]
        sample: Option<usize>,

        /// Seed for `--sample`; the same seed picks the same files.
        #[arg(long)]
        seed: Option<String>,

        /// Maximum simultaneous model requests.
        #[arg(long)]
        llm_concurrency: Option<usize>,

        /// Skip the refinement stage and print survivors in input order.
        #[arg(long)]
        no_refine: bool,

        /// Skip the skeleton stage and evaluate every file's full source.
        #[arg(long)]
        no_skeleton: bool,

        /// Cache mode: `disabled`, `read-only`, `write-only` or `read-write`.
        #[arg(long)]
        cache: Option<String>,

        /// Output format: `text` or `json`.
        #[arg(long, default_value = "text")]
        format: String,

        /// Diagnostics on stderr: `off`, `human` or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        diagnostics: Option<String>,
    },

    /// Print the skeleton of each file.
    Skeleton {
        /// Source files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Create the cache database and schema.
    ///
    /// Idempotent; running it on an existing cache is safe.
    Init,
}

fn init_tracing(diagnostics: DiagnosticsMode) {
    let filter = EnvFilter::try_from_env("LLMAP_LOG").unwrap_or_else(|_| {
        if diagnostics == DiagnosticsMode::Human {
            EnvFilter::new("warn,llmap::diagnostics=info")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let diagnostics = match &cli.command {
        Commands::Run {
            diagnostics: Some(mode),
            ..
        } => DiagnosticsMode::parse(mode)?,
        Commands::Run { .. } => DiagnosticsMode::default_for_tty(),
        _ => DiagnosticsMode::Off,
    };
    init_tracing(diagnostics);

    match cli.command {
        Commands::Skeleton { files } => print_skeletons(&files)?,
        Commands::Init => {
            let cfg = config::load_or_default(cli.config.as_deref())?;
            migrate::run_migrations(&cfg).await?;
            println!(
                "Cache database initialized at {}.",
                cfg.cache.path.display()
            );
        }
        Commands::Run {
            question,
            sample,
            seed,
            llm_concurrency,
            no_refine,
            no_skeleton,
            cache,
            format,
            ..
        } => {
            let mut cfg = config::load_or_default(cli.config.as_deref())?;
            if let Some(mode) = cache {
                cfg.cache.mode = mode.parse()?;
            }
            if let Some(n) = llm_concurrency {
                anyhow::ensure!(n > 0, "--llm-concurrency must be >= 1");
                cfg.pipeline.max_concurrent_requests = n;
            }
            let options = PipelineOptions {
                skip_skeleton: no_skeleton,
                skip_refine: no_refine,
                max_concurrent_requests: cfg.pipeline.max_concurrent_requests,
                sample_size: sample,
                sample_seed: seed,
            };
            let format = OutputFormat::parse(&format)?;
            run(&cfg, Question::new(question), options, format, diagnostics).await?;
        }
    }

    Ok(())
}

async fn run(
    cfg: &Config,
    question: Question,
    options: PipelineOptions,
    format: OutputFormat,
    diagnostics: DiagnosticsMode,
) -> Result<()> {
    let (files, missing) = read_paths(std::io::stdin().lock()).context("Failed to read paths from stdin")?;
    for warning in &missing {
        eprintln!("warning: {}", warning);
    }
    if files.is_empty() {
        return Err(RunError::InvalidInput("no readable files on stdin".to_string()).into());
    }

    let client = ChatClient::from_config(&cfg.model)?;
    let settings = EvaluatorSettings::from_config(cfg)?;
    let cache = open_cache(cfg).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling: finishing in-flight requests...");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::new(Arc::new(client), Arc::new(cache), settings)
        .with_sink(Arc::from(diagnostics.sink()))
        .with_cancellation(cancel);

    let result = pipeline.run(files, &question, &options).await?;

    let stdout = std::io::stdout();
    output::write_results(&mut stdout.lock(), format, &question, &result)?;
    output::write_report(&mut std::io::stderr().lock(), &result)?;
    Ok(())
}

/// Open the configured cache. A corrupt store ends the run; an unreachable
/// one leaves the run uncached.
async fn open_cache(cfg: &Config) -> Result<ResponseCache> {
    if cfg.cache.mode == CacheMode::Disabled {
        return Ok(ResponseCache::disabled());
    }
    match SqliteCacheStore::open(&cfg.cache.path).await {
        Ok(store) => Ok(ResponseCache::new(Arc::new(store), cfg.cache.mode)),
        Err(CacheError::Corrupt(message)) => Err(RunError::CacheCorrupt(format!(
            "{}: {}",
            cfg.cache.path.display(),
            message
        ))
        .into()),
        Err(e) => {
            warn!(path = %cfg.cache.path.display(), error = %e, "Running without the response cache");
            eprintln!("warning: cache unavailable, running uncached: {}", e);
            Ok(ResponseCache::disabled())
        }
    }
}

fn print_skeletons(files: &[PathBuf]) -> Result<()> {
    let registry = default_registry();
    for path in files {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        println!("# {}", path.display());
        match registry.extract(language_for_path(path), &source) {
            Extraction::Skeleton(skeleton) => println!("{}\n", skeleton),
            Extraction::Unsupported => println!("(no skeleton: unsupported language)\n"),
        }
    }
    Ok(())
}
