//! Refinement helpers: the ranking grammar and snippet deduplication.
//!
//! A refinement response lists files best-first:
//!
//! ```text
//! RANK 1: src/db/Pool.java
//! WHY: creates the connection pool
//! RANK 2: src/Config.java
//! ```
//!
//! Other lines are ignored, so the model may add commentary. Ranking is
//! advisory; callers must keep every survivor whether or not it is listed.

use std::collections::HashSet;

use thiserror::Error;

use crate::models::{FileId, StageVerdict};
use crate::verdict::tag_value;

/// One ranked entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedFile {
    pub rank: usize,
    pub file: FileId,
    pub why: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RankingError {
    #[error("response contains no RANK lines")]
    NoRanks,
    #[error("no ranked path matches a candidate file")]
    NoKnownFiles,
}

/// Split `RANK <n>: <path>` into its number and path.
fn rank_line(line: &str) -> Option<(usize, &str)> {
    let l = line.trim().trim_start_matches(['*', '#', '-', ' ']);
    let head = l.get(..4)?;
    if !head.eq_ignore_ascii_case("RANK") {
        return None;
    }
    let (number, path) = l[4..].split_once(':')?;
    let number: usize = number.trim().trim_matches('*').trim().parse().ok()?;
    let path = path.trim_matches(|c: char| c == '*' || c == '`' || c.is_whitespace());
    if path.is_empty() {
        return None;
    }
    Some((number, path))
}

/// Parse a ranking over `candidates`.
///
/// Paths that are not candidates are skipped, as are repeated mentions of
/// the same file (the first one wins). The result is sorted by rank; ties
/// keep response order.
pub fn parse_ranking(text: &str, candidates: &[FileId]) -> Result<Vec<RankedFile>, RankingError> {
    let mut saw_rank = false;
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ranked: Vec<RankedFile> = Vec::new();
    let mut last_kept = false;

    for line in text.lines() {
        if let Some((rank, path)) = rank_line(line) {
            saw_rank = true;
            last_kept = false;
            let Some(file) = candidates.iter().find(|c| c.as_str() == path) else {
                continue;
            };
            if !seen.insert(file.as_str()) {
                continue;
            }
            ranked.push(RankedFile {
                rank,
                file: file.clone(),
                why: None,
            });
            last_kept = true;
        } else if let Some(why) = tag_value(line, "WHY") {
            if last_kept && !why.is_empty() {
                if let Some(entry) = ranked.last_mut() {
                    entry.why.get_or_insert_with(|| why.to_string());
                }
            }
        }
    }

    if !saw_rank {
        return Err(RankingError::NoRanks);
    }
    if ranked.is_empty() {
        return Err(RankingError::NoKnownFiles);
    }
    ranked.sort_by_key(|r| r.rank);
    Ok(ranked)
}

/// Remove exact-duplicate snippets across `verdicts`, comparing quoted text
/// after whitespace trim. The first occurrence in slice order is kept.
/// Returns the number of snippets removed.
pub fn dedup_snippets(verdicts: &mut [StageVerdict]) -> usize {
    let mut seen: HashSet<String> = HashSet::new();
    let mut removed = 0;
    for verdict in verdicts.iter_mut() {
        let before = verdict.snippets().len();
        verdict.retain_snippets(|s| seen.insert(s.text.trim().to_string()));
        removed += before - verdict.snippets().len();
    }
    removed
}
