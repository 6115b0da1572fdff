//! Java skeletons.
//!
//! Keeps the package and import lines, type declarations (with modifiers,
//! type parameters, `extends`/`implements`), enum constants, fields without
//! initializers, and method/constructor signatures. Bodies print as `{...}`
//! and annotations are removed.

use tree_sitter::Node;

use super::{children, collapse, parse, text, Extraction, Outline, SkeletonExtractor};

pub struct JavaSkeleton;

impl SkeletonExtractor for JavaSkeleton {
    fn language(&self) -> &str {
        "java"
    }

    fn extract(&self, source: &str) -> Extraction {
        let Some(tree) = parse(tree_sitter_java::LANGUAGE.into(), source) else {
            return Extraction::Unsupported;
        };
        let mut out = Outline::new("  ");
        for node in children(tree.root_node()) {
            match node.kind() {
                "package_declaration" | "import_declaration" => {
                    out.push(0, collapse(text(node, source)));
                }
                _ => member(node, source, 0, &mut out),
            }
        }
        out.finish()
    }
}

const TYPE_DECLARATIONS: &[&str] = &[
    "class_declaration",
    "interface_declaration",
    "enum_declaration",
    "record_declaration",
    "annotation_type_declaration",
];

fn member(node: Node<'_>, source: &str, depth: usize, out: &mut Outline) {
    match node.kind() {
        kind if TYPE_DECLARATIONS.contains(&kind) => type_declaration(node, source, depth, out),
        "method_declaration" | "constructor_declaration" => {
            let line = match node.child_by_field_name("body") {
                Some(body) => format!("{} {{...}}", header(node, body.start_byte(), source)),
                None => header(node, node.end_byte(), source),
            };
            out.push(depth, line);
        }
        "field_declaration" | "constant_declaration" => out.push(depth, field(node, source)),
        "annotation_type_element_declaration" => {
            out.push(depth, header(node, node.end_byte(), source));
        }
        _ => {}
    }
}

fn type_declaration(node: Node<'_>, source: &str, depth: usize, out: &mut Outline) {
    let Some(body) = node.child_by_field_name("body") else {
        out.push(depth, header(node, node.end_byte(), source));
        return;
    };
    out.push(depth, format!("{} {{", header(node, body.start_byte(), source)));

    let members = children(body);
    let constants: Vec<&str> = members
        .iter()
        .filter(|c| c.kind() == "enum_constant")
        .map(|c| text(c.child_by_field_name("name").unwrap_or(*c), source))
        .collect();
    if !constants.is_empty() {
        out.push(depth + 1, format!("{};", constants.join(", ")));
    }
    for child in members {
        if child.kind() == "enum_body_declarations" {
            for decl in children(child) {
                member(decl, source, depth + 1, out);
            }
        } else {
            member(child, source, depth + 1, out);
        }
    }
    out.push(depth, "}");
}

/// Source text of `node` up to `end`, with annotations removed and
/// whitespace collapsed.
fn header(node: Node<'_>, end: usize, source: &str) -> String {
    let mut kept = String::new();
    let mut pos = node.start_byte();
    for annotation in annotations(node) {
        kept.push_str(source.get(pos..annotation.start_byte()).unwrap_or(""));
        pos = annotation.end_byte();
    }
    kept.push_str(source.get(pos..end).unwrap_or(""));
    collapse(&kept)
}

fn annotations(node: Node<'_>) -> Vec<Node<'_>> {
    children(node)
        .into_iter()
        .filter(|c| c.kind() == "modifiers")
        .flat_map(children)
        .filter(|m| matches!(m.kind(), "annotation" | "marker_annotation"))
        .collect()
}

/// `modifiers type name[, name];` without initializer values.
fn field(node: Node<'_>, source: &str) -> String {
    let mut cursor = node.walk();
    let declarators: Vec<Node<'_>> = node
        .children_by_field_name("declarator", &mut cursor)
        .collect();
    let Some(first) = declarators.first() else {
        return header(node, node.end_byte(), source);
    };
    let names: Vec<String> = declarators
        .iter()
        .map(|d| {
            let end = d
                .child_by_field_name("value")
                .map(|v| v.start_byte())
                .unwrap_or(d.end_byte());
            let raw = source.get(d.start_byte()..end).unwrap_or("");
            collapse(raw.trim_end().trim_end_matches('='))
        })
        .collect();
    format!("{} {};", header(node, first.start_byte(), source), names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton(source: &str) -> String {
        match JavaSkeleton.extract(source) {
            Extraction::Skeleton(s) => s,
            Extraction::Unsupported => panic!("expected a skeleton"),
        }
    }

    const DB: &str = r#"
package com.example.db;

import java.sql.Connection;
import javax.sql.DataSource;

@Service
public class ConnectionFactory extends Base implements AutoCloseable {
    @Inject
    private final DataSource dataSource = lookup("jdbc/main");
    private int retries, timeout = 30;

    public ConnectionFactory(DataSource ds) {
        this.dataSource = ds;
    }

    @Override
    public Connection getConnection(String url)
            throws SQLException {
        return dataSource.getConnection();
    }

    abstract void reset();

    static class Pool {
        void drain() { }
    }
}
"#;

    #[test]
    fn test_class_signatures_without_bodies() {
        let s = skeleton(DB);
        let expected = "\
package com.example.db;
import java.sql.Connection;
import javax.sql.DataSource;
public class ConnectionFactory extends Base implements AutoCloseable {
  private final DataSource dataSource;
  private int retries, timeout;
  public ConnectionFactory(DataSource ds) {...}
  public Connection getConnection(String url) throws SQLException {...}
  abstract void reset();
  static class Pool {
    void drain() {...}
  }
}";
        assert_eq!(s, expected);
        assert!(!s.contains("return"));
        assert!(!s.contains('@'));
    }

    #[test]
    fn test_enum_constants_and_interface() {
        let src = r#"
enum Level { LOW, HIGH; int weight() { return 1; } }
interface Store { int MAX = 3; void put(String k); }
"#;
        let s = skeleton(src);
        let expected = "\
enum Level {
  LOW, HIGH;
  int weight() {...}
}
interface Store {
  int MAX;
  void put(String k);
}";
        assert_eq!(s, expected);
    }

    #[test]
    fn test_file_without_declarations_is_unsupported() {
        assert_eq!(JavaSkeleton.extract("// just a comment\n"), Extraction::Unsupported);
    }
}
