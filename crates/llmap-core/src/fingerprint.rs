//! Content fingerprints and cache keys.
//!
//! Both are SHA-256 digests over length-prefixed fields, so no two distinct
//! field tuples can collide by concatenation. They depend only on their
//! inputs (never on run order, time or concurrency), which is what lets an
//! interrupted run resume from the cache.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::chunk::SourceChunk;
use crate::models::{FileId, Question, Stage};

/// Bumped whenever the prompt wording or response grammar changes in a way
/// that makes earlier cached responses unsuitable.
pub const KEY_FORMAT_VERSION: &str = "llmap-cache-v1";

fn digest_fields(fields: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    hex::encode(hasher.finalize())
}

/// Deterministic digest of a file's identity and content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a file by path and content.
    pub fn of_file(id: &FileId, content: &str) -> Self {
        Self(digest_fields(&[id.as_str().as_bytes(), content.as_bytes()]))
    }

    /// Fingerprint arbitrary text (used for refinement groups).
    pub fn of_text(text: &str) -> Self {
        Self(digest_fields(&[text.as_bytes()]))
    }

    /// Fingerprint of the skeleton actually shown to the model, after any
    /// truncation.
    pub fn for_skeleton(&self, skeleton: &str) -> Self {
        Self(digest_fields(&[
            self.0.as_bytes(),
            Stage::Skeleton.as_str().as_bytes(),
            skeleton.as_bytes(),
        ]))
    }

    /// Fingerprint of `chunk`, one of `count` chunks of the file.
    ///
    /// A file evaluated in a single chunk keeps its own fingerprint. Otherwise
    /// the chunk's text and line offset are hashed in, so moving a chunk
    /// boundary always changes the key.
    pub fn for_chunk(&self, chunk: &SourceChunk, count: usize) -> Self {
        if count <= 1 {
            return self.clone();
        }
        Self(digest_fields(&[
            self.0.as_bytes(),
            &(chunk.index as u64).to_le_bytes(),
            &(count as u64).to_le_bytes(),
            &(chunk.line_offset as u64).to_le_bytes(),
            chunk.text.as_bytes(),
        ]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a cached model response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key over (format version, question, stage, model, fingerprint).
    pub fn new(question: &Question, stage: Stage, model: &str, fingerprint: &Fingerprint) -> Self {
        Self(digest_fields(&[
            KEY_FORMAT_VERSION.as_bytes(),
            question.as_str().as_bytes(),
            stage.as_str().as_bytes(),
            model.as_bytes(),
            fingerprint.as_str().as_bytes(),
        ]))
    }

    /// Wrap an already-computed key, e.g. one read back from a store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable_for_same_inputs() {
        let q = Question::new("Where is the database connection configured?");
        let fp = Fingerprint::of_file(&FileId::new("src/Db.java"), "class Db {}");
        let a = CacheKey::new(&q, Stage::Skeleton, "deepseek-chat", &fp);
        let b = CacheKey::new(&q.clone(), Stage::Skeleton, "deepseek-chat", &fp.clone());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_key_changes_with_each_field() {
        let q = Question::new("q");
        let fp = Fingerprint::of_file(&FileId::new("a.py"), "x = 1");
        let base = CacheKey::new(&q, Stage::Skeleton, "m", &fp);
        assert_ne!(base, CacheKey::new(&Question::new("q2"), Stage::Skeleton, "m", &fp));
        assert_ne!(base, CacheKey::new(&q, Stage::FullSource, "m", &fp));
        assert_ne!(base, CacheKey::new(&q, Stage::Skeleton, "m2", &fp));
        let changed = Fingerprint::of_file(&FileId::new("a.py"), "x = 2");
        assert_ne!(base, CacheKey::new(&q, Stage::Skeleton, "m", &changed));
    }

    #[test]
    fn test_length_prefix_prevents_concatenation_collisions() {
        let a = Fingerprint::of_file(&FileId::new("ab"), "c");
        let b = Fingerprint::of_file(&FileId::new("a"), "bc");
        assert_ne!(a, b);
    }

    fn chunk(index: usize, line_offset: usize, text: &str) -> SourceChunk {
        SourceChunk {
            index,
            line_offset,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_single_chunk_keeps_file_fingerprint() {
        let fp = Fingerprint::of_text("body");
        assert_eq!(fp.for_chunk(&chunk(0, 0, "body"), 1), fp);
        assert_ne!(fp.for_chunk(&chunk(0, 0, "bo"), 2), fp);
        assert_ne!(
            fp.for_chunk(&chunk(0, 0, "bo"), 2),
            fp.for_chunk(&chunk(1, 1, "dy"), 2)
        );
    }

    #[test]
    fn test_moved_chunk_boundary_changes_fingerprint() {
        let fp = Fingerprint::of_text("a\nb\nc\nd\n");
        let narrow = fp.for_chunk(&chunk(1, 2, "c\nd\n"), 2);
        let wide = fp.for_chunk(&chunk(1, 3, "d\n"), 2);
        assert_ne!(narrow, wide);
        assert_ne!(
            fp.for_chunk(&chunk(0, 0, "a\nb\n"), 2),
            fp.for_chunk(&chunk(0, 0, "a\nb\nc\n"), 2)
        );
    }

    #[test]
    fn test_skeleton_fingerprint_follows_shown_text() {
        let fp = Fingerprint::of_file(&FileId::new("Db.java"), "class Db { void a() {} void b() {} }");
        let full = fp.for_skeleton("class Db {\n  void a() {...}\n  void b() {...}\n}");
        let truncated = fp.for_skeleton("class Db {\n  void a() {...}");
        assert_ne!(full, truncated);
        assert_ne!(full, fp);
        assert_eq!(full, fp.for_skeleton("class Db {\n  void a() {...}\n  void b() {...}\n}"));
    }
}
