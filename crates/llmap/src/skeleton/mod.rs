//! Tree-sitter skeleton grammars.
//!
//! Each submodule implements [`SkeletonExtractor`] for one language by
//! walking the concrete syntax tree and printing declarations without their
//! bodies. [`default_registry`] wires up every grammar shipped with llmap.
//!
//! | Language | Extractor | Extensions |
//! |----------|-----------|------------|
//! | `java` | [`JavaSkeleton`] | `.java` |
//! | `python` | [`PythonSkeleton`] | `.py`, `.pyi` |

mod java;
mod python;

use std::sync::Arc;

use tree_sitter::{Language, Node, Parser, Tree};

pub use java::JavaSkeleton;
pub use llmap_core::skeleton::{
    language_for_path, truncate_lines, Extraction, SkeletonExtractor, SkeletonRegistry,
};
pub use python::PythonSkeleton;

/// Registry with the Java and Python extractors.
pub fn default_registry() -> SkeletonRegistry {
    let mut registry = SkeletonRegistry::new();
    registry.register(Arc::new(JavaSkeleton));
    registry.register(Arc::new(PythonSkeleton));
    registry
}

/// Parse `source` with `language`. `None` if the grammar cannot be loaded
/// or the parser gives up.
fn parse(language: Language, source: &str) -> Option<Tree> {
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    parser.parse(source, None)
}

fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    source.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

/// Collapse every whitespace run to one space.
fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collects skeleton lines with an indentation unit.
struct Outline {
    unit: &'static str,
    lines: Vec<String>,
}

impl Outline {
    fn new(unit: &'static str) -> Self {
        Self {
            unit,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, depth: usize, line: impl AsRef<str>) {
        let line = line.as_ref();
        if line.is_empty() {
            return;
        }
        self.lines.push(format!("{}{}", self.unit.repeat(depth), line));
    }

    fn finish(self) -> Extraction {
        if self.lines.is_empty() {
            Extraction::Unsupported
        } else {
            Extraction::Skeleton(self.lines.join("\n"))
        }
    }
}
