//! Rendering of run results.
//!
//! Confirmed records go to stdout as text or JSON. Inconclusive files and
//! run warnings go to stderr through [`write_report`], so a script piping
//! stdout only ever sees confirmed results.

use anyhow::Result;
use std::io::Write;

use llmap_core::models::Question;

use crate::pipeline::PipelineResult;

/// Result format for `llmap run`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => anyhow::bail!("Unknown output format: '{}'. Must be text or json.", other),
        }
    }
}

pub fn write_results(
    out: &mut impl Write,
    format: OutputFormat,
    question: &Question,
    result: &PipelineResult,
) -> Result<()> {
    match format {
        OutputFormat::Text => write_text(out, result),
        OutputFormat::Json => write_json(out, question, result),
    }
}

/// One block per file: path, explanation, then each snippet.
pub fn write_text(out: &mut impl Write, result: &PipelineResult) -> Result<()> {
    for record in &result.records {
        match record.rank {
            Some(rank) => writeln!(out, "## {} (rank {})", record.file, rank)?,
            None => writeln!(out, "## {}", record.file)?,
        }
        if let Some(why) = &record.why {
            writeln!(out, "Ranked for: {}", why)?;
        }
        writeln!(out, "{}", record.verdict.explanation.trim())?;
        for snippet in record.verdict.snippets() {
            writeln!(out)?;
            match snippet.lines {
                Some(range) => writeln!(out, "Lines {}-{}: {}", range.start, range.end, snippet.justification)?,
                None => writeln!(out, "{}", snippet.justification)?,
            }
            writeln!(out, "```")?;
            writeln!(out, "{}", snippet.text.trim_end())?;
            writeln!(out, "```")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_json(out: &mut impl Write, question: &Question, result: &PipelineResult) -> Result<()> {
    let results: Vec<serde_json::Value> = result
        .records
        .iter()
        .map(|r| {
            serde_json::json!({
                "file": r.file,
                "rank": r.rank,
                "why": r.why,
                "score": r.verdict.relevance.score,
                "explanation": r.verdict.explanation,
                "snippets": r.verdict.snippets(),
            })
        })
        .collect();

    let doc = serde_json::json!({
        "question": question.as_str(),
        "refinement": result.refinement.as_str(),
        "cancelled": result.cancelled,
        "results": results,
        "stats": result.stats,
    });
    serde_json::to_writer_pretty(&mut *out, &doc)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Warnings and inconclusive files, for stderr.
pub fn write_report(err: &mut impl Write, result: &PipelineResult) -> Result<()> {
    for warning in &result.warnings {
        writeln!(err, "warning: {}", warning)?;
    }
    if !result.inconclusive.is_empty() {
        writeln!(err, "Inconclusive files ({}):", result.inconclusive.len())?;
        for file in &result.inconclusive {
            writeln!(err, "  {} [{} at {}] {}", file.file, file.class, file.stage, file.reason)?;
        }
    }
    if result.cancelled {
        writeln!(err, "Run cancelled; results are partial.")?;
    }
    Ok(())
}
