//! Strict grammar for stage responses.
//!
//! A stage response must have this shape (tags are case-insensitive and may
//! be wrapped in markdown emphasis):
//!
//! ````text
//! VERDICT: RELEVANT | IRRELEVANT
//! SCORE: <0-10>                      (optional)
//! EXPLANATION: <text, may continue on following lines>
//! SNIPPET <start>-<end>              (zero or more; range optional)
//! WHY: <justification>
//! ```<lang>
//! <quoted code>
//! ```
//! ````
//!
//! Anything before the `VERDICT:` line is ignored, since models often think
//! aloud first. After it, only the documented fields and blank lines are
//! allowed. The legacy markers `LLMAP_RELEVANT` / `LLMAP_IRRELEVANT` are
//! accepted as verdict values.

use thiserror::Error;

use crate::models::{LineRange, Relevance, Snippet, StageVerdict};

/// Why a response could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,
    #[error("no VERDICT line found")]
    MissingVerdict,
    #[error("VERDICT must be RELEVANT or IRRELEVANT, got '{0}'")]
    InvalidVerdict(String),
    #[error("SCORE must be an integer from 0 to 10, got '{0}'")]
    InvalidScore(String),
    #[error("missing or empty EXPLANATION")]
    MissingExplanation,
    #[error("line {line}: unexpected text '{text}'")]
    UnexpectedLine { line: usize, text: String },
    #[error("invalid snippet line range '{0}'")]
    InvalidLineRange(String),
    #[error("snippet {snippet} has no WHY line")]
    MissingJustification { snippet: usize },
    #[error("snippet {snippet} has no fenced code block")]
    MissingCode { snippet: usize },
    #[error("snippet {snippet} code block is not closed")]
    UnterminatedCode { snippet: usize },
}

/// If `line` is `TAG: value` (tag matched case-insensitively, optional
/// markdown `*`/`#` decoration), return the trimmed value.
pub(crate) fn tag_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let l = line.trim().trim_start_matches(['*', '#', ' ']);
    if l.len() < tag.len() || !l.is_char_boundary(tag.len()) {
        return None;
    }
    let (head, rest) = l.split_at(tag.len());
    if !head.eq_ignore_ascii_case(tag) {
        return None;
    }
    let rest = rest.trim_start_matches('*').trim_start();
    let value = rest.strip_prefix(':')?;
    Some(value.trim().trim_matches('*').trim())
}

/// If `line` starts with the bare word `SNIPPET`, return what follows it.
fn snippet_header(line: &str) -> Option<&str> {
    let l = line.trim().trim_start_matches(['*', '#', ' ']);
    const TAG: &str = "SNIPPET";
    if l.len() < TAG.len() || !l.is_char_boundary(TAG.len()) {
        return None;
    }
    let (head, rest) = l.split_at(TAG.len());
    if !head.eq_ignore_ascii_case(TAG) {
        return None;
    }
    if rest.chars().next().is_some_and(|c| c.is_alphanumeric()) {
        return None;
    }
    Some(rest.trim_matches(|c: char| c == '*' || c == ':' || c.is_whitespace()))
}

fn parse_range(raw: &str) -> Result<Option<LineRange>, ParseError> {
    let raw = raw
        .trim()
        .trim_start_matches("lines")
        .trim_start_matches("line")
        .trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let invalid = || ParseError::InvalidLineRange(raw.to_string());
    let (start, end) = match raw.split_once('-') {
        Some((a, b)) => (a.trim(), b.trim()),
        None => (raw, raw),
    };
    let start: usize = start.parse().map_err(|_| invalid())?;
    let end: usize = end.parse().map_err(|_| invalid())?;
    if start == 0 || end < start {
        return Err(invalid());
    }
    Ok(Some(LineRange { start, end }))
}

fn parse_relevance(value: &str) -> Result<bool, ParseError> {
    let word = value
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
        .to_ascii_uppercase();
    match word.trim_start_matches("LLMAP_") {
        "RELEVANT" => Ok(true),
        "IRRELEVANT" => Ok(false),
        _ => Err(ParseError::InvalidVerdict(value.to_string())),
    }
}

fn parse_score(value: &str) -> Result<u8, ParseError> {
    let raw = value.split('/').next().unwrap_or("").trim();
    match raw.parse::<u8>() {
        Ok(n) if n <= 10 => Ok(n),
        _ => Err(ParseError::InvalidScore(value.to_string())),
    }
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Parse a stage response into a [`StageVerdict`].
pub fn parse_verdict(text: &str) -> Result<StageVerdict, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let lines: Vec<&str> = text.lines().collect();
    let verdict_at = lines
        .iter()
        .position(|l| tag_value(l, "VERDICT").is_some())
        .ok_or(ParseError::MissingVerdict)?;
    let relevant = parse_relevance(tag_value(lines[verdict_at], "VERDICT").unwrap_or(""))?;

    let mut i = verdict_at + 1;
    let skip_blank = |i: &mut usize| {
        while *i < lines.len() && lines[*i].trim().is_empty() {
            *i += 1;
        }
    };

    skip_blank(&mut i);
    let mut relevance = if relevant {
        Relevance::relevant()
    } else {
        Relevance::irrelevant()
    };
    if i < lines.len() {
        if let Some(score) = tag_value(lines[i], "SCORE") {
            relevance = relevance.with_score(parse_score(score)?);
            i += 1;
            skip_blank(&mut i);
        }
    }

    let first = match lines.get(i).and_then(|l| tag_value(l, "EXPLANATION")) {
        Some(v) => v,
        None => return Err(ParseError::MissingExplanation),
    };
    i += 1;
    let mut explanation: Vec<&str> = Vec::new();
    if !first.is_empty() {
        explanation.push(first);
    }
    while i < lines.len() && snippet_header(lines[i]).is_none() {
        explanation.push(lines[i]);
        i += 1;
    }
    let explanation = explanation.join("\n").trim().to_string();
    if explanation.is_empty() {
        return Err(ParseError::MissingExplanation);
    }

    let mut snippets = Vec::new();
    while i < lines.len() {
        let number = snippets.len() + 1;
        let header = match snippet_header(lines[i]) {
            Some(h) => h,
            None => {
                return Err(ParseError::UnexpectedLine {
                    line: i + 1,
                    text: lines[i].trim().to_string(),
                })
            }
        };
        let range = parse_range(header)?;
        i += 1;
        skip_blank(&mut i);

        let justification = lines
            .get(i)
            .and_then(|l| tag_value(l, "WHY"))
            .filter(|v| !v.is_empty())
            .ok_or(ParseError::MissingJustification { snippet: number })?
            .to_string();
        i += 1;
        skip_blank(&mut i);

        if !lines.get(i).is_some_and(|l| is_fence(l)) {
            return Err(ParseError::MissingCode { snippet: number });
        }
        i += 1;
        let code_start = i;
        while i < lines.len() && !is_fence(lines[i]) {
            i += 1;
        }
        if i >= lines.len() {
            return Err(ParseError::UnterminatedCode { snippet: number });
        }
        let code = lines[code_start..i].join("\n");
        i += 1;
        skip_blank(&mut i);

        snippets.push(Snippet {
            lines: range,
            justification,
            text: code,
        });
    }

    Ok(StageVerdict::new(relevance, explanation, snippets))
}
