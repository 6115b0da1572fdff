//! Input file units and sampling.
//!
//! A [`FileUnit`] names one file and knows where to read it from. The
//! source text is loaded only inside the stage task that needs it.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llmap_core::models::FileId;
use llmap_core::skeleton::language_for_path;

use crate::error::EvaluationError;

/// Where a file's text comes from.
#[derive(Debug, Clone)]
pub enum SourceRef {
    Path(PathBuf),
    /// Text supplied directly, e.g. by an embedding application or a test.
    Inline(Arc<str>),
}

/// One file of the input set.
#[derive(Debug, Clone)]
pub struct FileUnit {
    id: FileId,
    source: SourceRef,
    language: Option<&'static str>,
}

impl FileUnit {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: FileId::new(path.to_string_lossy()),
            language: language_for_path(&path),
            source: SourceRef::Path(path),
        }
    }

    /// A file whose text is already in memory. `path` is its identity and
    /// decides the language.
    pub fn inline(path: &str, text: impl Into<String>) -> Self {
        Self {
            id: FileId::new(path),
            language: language_for_path(Path::new(path)),
            source: SourceRef::Inline(Arc::from(text.into())),
        }
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn language(&self) -> Option<&'static str> {
        self.language
    }

    /// Read the file's text.
    pub async fn load(&self) -> Result<String, EvaluationError> {
        match &self.source {
            SourceRef::Inline(text) => Ok(text.to_string()),
            SourceRef::Path(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| EvaluationError::Source(format!("{}: {}", path.display(), e))),
        }
    }
}

/// Read file paths, one per line. Blank lines are ignored. Paths that are
/// not regular files, and repeats of a path already read, are skipped with
/// a warning.
pub fn read_paths(reader: impl BufRead) -> anyhow::Result<(Vec<FileUnit>, Vec<String>)> {
    let mut files = Vec::new();
    let mut warnings = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let path = line.trim();
        if path.is_empty() {
            continue;
        }
        if Path::new(path).is_file() {
            files.push(FileUnit::from_path(path));
        } else {
            warnings.push(format!("File does not exist: {}", path));
        }
    }
    let (files, duplicates) = dedup(files);
    warnings.extend(duplicates);
    Ok((files, warnings))
}

/// Drop every file whose id was already seen, keeping the first. Returns
/// the kept files in input order and one warning per dropped file.
pub fn dedup(files: Vec<FileUnit>) -> (Vec<FileUnit>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut warnings = Vec::new();
    let kept = files
        .into_iter()
        .filter(|f| {
            let first = seen.insert(f.id().clone());
            if !first {
                warnings.push(format!("Duplicate file ignored: {}", f.id()));
            }
            first
        })
        .collect();
    (kept, warnings)
}

fn sample_rank(seed: &str, id: &FileId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((seed.len() as u64).to_le_bytes());
    hasher.update(seed.as_bytes());
    hasher.update(id.as_str().as_bytes());
    hasher.finalize().into()
}

/// Keep `n` files chosen by `seed`. The same seed and input always keep the
/// same files; kept files stay in input order.
pub fn sample(files: Vec<FileUnit>, n: usize, seed: &str) -> Vec<FileUnit> {
    if n >= files.len() {
        return files;
    }
    let mut ranked: Vec<(usize, [u8; 32])> = files
        .iter()
        .enumerate()
        .map(|(i, f)| (i, sample_rank(seed, f.id())))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1));
    let mut keep: Vec<usize> = ranked.into_iter().take(n).map(|(i, _)| i).collect();
    keep.sort_unstable();

    let mut keep = keep.into_iter().peekable();
    files
        .into_iter()
        .enumerate()
        .filter_map(|(i, f)| {
            if keep.peek() == Some(&i) {
                keep.next();
                Some(f)
            } else {
                None
            }
        })
        .collect()
}
