//! Skeleton extraction capability.
//!
//! A skeleton is the structural outline of a source file: type
//! declarations, signatures and fields without bodies. It is what the
//! first, cheap stage shows the model.
//!
//! Extractors are registered per language id in a [`SkeletonRegistry`].
//! A language without an extractor, or an extractor that cannot make
//! sense of its input, yields [`Extraction::Unsupported`]; the pipeline
//! then sends the file straight to full-source evaluation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Outcome of skeleton extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Skeleton(String),
    /// Routing signal, not an error: evaluate the full source instead.
    Unsupported,
}

/// Turns the source text of one language into a skeleton.
///
/// Implementations must be deterministic and free of I/O.
pub trait SkeletonExtractor: Send + Sync {
    /// Language id this extractor handles, e.g. `"java"`.
    fn language(&self) -> &str;

    fn extract(&self, source: &str) -> Extraction;
}

/// Extractors keyed by language id.
#[derive(Clone, Default)]
pub struct SkeletonRegistry {
    extractors: HashMap<String, Arc<dyn SkeletonExtractor>>,
}

impl SkeletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `extractor` under its language id, replacing any previous one.
    pub fn register(&mut self, extractor: Arc<dyn SkeletonExtractor>) {
        self.extractors
            .insert(extractor.language().to_string(), extractor);
    }

    pub fn supports(&self, language: &str) -> bool {
        self.extractors.contains_key(language)
    }

    /// Extract a skeleton, or `Unsupported` when no extractor is registered
    /// or the extractor produced nothing.
    pub fn extract(&self, language: Option<&str>, source: &str) -> Extraction {
        let Some(extractor) = language.and_then(|l| self.extractors.get(l)) else {
            return Extraction::Unsupported;
        };
        match extractor.extract(source) {
            Extraction::Skeleton(s) if s.trim().is_empty() => Extraction::Unsupported,
            other => other,
        }
    }

    /// Registered language ids, sorted.
    pub fn languages(&self) -> Vec<&str> {
        let mut langs: Vec<&str> = self.extractors.keys().map(String::as_str).collect();
        langs.sort_unstable();
        langs
    }
}

/// Language id for a path, from its extension.
pub fn language_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "java" => Some("java"),
        "py" | "pyi" => Some("python"),
        _ => None,
    }
}

/// Halve `text` by lines until it is at most `max_chars` long.
///
/// A single line that is still too long is returned as is.
pub fn truncate_lines(text: &str, max_chars: usize) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    loop {
        let joined = lines.join("\n");
        if joined.len() <= max_chars || lines.len() <= 1 {
            return joined;
        }
        lines.truncate(lines.len() / 2);
    }
}
