//! Python skeletons: imports, decorators, class headers, `def` signatures
//! and annotated or plain assignments at module and class level.

use tree_sitter::Node;

use super::{children, collapse, parse, text, Extraction, Outline, SkeletonExtractor};

pub struct PythonSkeleton;

impl SkeletonExtractor for PythonSkeleton {
    fn language(&self) -> &str {
        "python"
    }

    fn extract(&self, source: &str) -> Extraction {
        let Some(tree) = parse(tree_sitter_python::LANGUAGE.into(), source) else {
            return Extraction::Unsupported;
        };
        let mut out = Outline::new("    ");
        block(tree.root_node(), source, 0, &mut out);
        out.finish()
    }
}

fn block(node: Node<'_>, source: &str, depth: usize, out: &mut Outline) {
    for child in children(node) {
        statement(child, source, depth, out);
    }
}

fn statement(node: Node<'_>, source: &str, depth: usize, out: &mut Outline) {
    match node.kind() {
        "import_statement" | "import_from_statement" | "future_import_statement" => {
            out.push(depth, collapse(text(node, source)));
        }
        "decorated_definition" => {
            for child in children(node) {
                if child.kind() == "decorator" {
                    out.push(depth, collapse(text(child, source)));
                }
            }
            if let Some(definition) = node.child_by_field_name("definition") {
                statement(definition, source, depth, out);
            }
        }
        "class_definition" => {
            let Some(body) = node.child_by_field_name("body") else {
                return;
            };
            out.push(depth, signature(node, body, source));
            block(body, source, depth + 1, out);
        }
        "function_definition" => {
            if let Some(body) = node.child_by_field_name("body") {
                out.push(depth, format!("{} ...", signature(node, body, source)));
            }
        }
        "expression_statement" => {
            if let Some(line) = children(node).first().and_then(|c| assignment(*c, source)) {
                out.push(depth, line);
            }
        }
        _ => {}
    }
}

/// Header text up to the body, ending in `:`.
fn signature(node: Node<'_>, body: Node<'_>, source: &str) -> String {
    let head = source.get(node.start_byte()..body.start_byte()).unwrap_or("");
    collapse(head)
}

/// `name: type` for annotated assignments, `name = ...` otherwise.
fn assignment(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "assignment" {
        return None;
    }
    let left = collapse(text(node.child_by_field_name("left")?, source));
    let line = match node.child_by_field_name("type") {
        Some(ty) => format!("{}: {}", left, collapse(text(ty, source))),
        None => format!("{} = ...", left),
    };
    Some(line)
}
