use crate::chunker::Chunker;
use crate::error::{ChunkerError, Result};
use crate::language::Language;
use crate::types::{ChunkBoundary, ChunkKind, LineSpan};
use tree_sitter::{Node, Parser};

const ANONYMOUS: &str = "<anonymous>";

/// AST-based chunker backed by tree-sitter grammars.
///
/// Emits class-like containers as single chunks (their methods stay inside) and
/// free functions as their own chunks, including functions nested in functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeSitterChunker;

impl TreeSitterChunker {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Chunker for TreeSitterChunker {
    fn chunk(&self, source: &[u8], language: Language) -> Result<Vec<ChunkBoundary>> {
        if !language.supports_ast() {
            return Err(ChunkerError::unsupported_language(language.as_str()));
        }
        let content = std::str::from_utf8(source)?;

        // Parser is not Sync, so one is built per call.
        let ts_language = language.tree_sitter_language()?;
        let mut parser = Parser::new();
        parser
            .set_language(&ts_language)
            .map_err(|e| ChunkerError::tree_sitter(format!("Failed to set language: {e}")))?;

        let tree = parser
            .parse(content, None)
            .ok_or_else(|| ChunkerError::parse("Failed to parse source code"))?;

        let root = tree.root_node();
        let analyzer = AstAnalyzer {
            content,
            language,
        };
        let mut boundaries = Vec::new();
        analyzer.visit_children(root, &mut boundaries);
        boundaries.sort_by(|a, b| a.span.cmp(&b.span));
        Ok(boundaries)
    }
}

struct AstAnalyzer<'a> {
    content: &'a str,
    language: Language,
}

impl AstAnalyzer<'_> {
    fn visit_children(&self, node: Node, out: &mut Vec<ChunkBoundary>) {
        let mut cursor = node.walk();
        let children: Vec<_> = node.children(&mut cursor).collect();
        for child in children {
            self.visit(child, out);
        }
    }

    fn visit(&self, node: Node, out: &mut Vec<ChunkBoundary>) {
        match self.language {
            Language::Python => self.visit_python(node, out),
            Language::Rust => self.visit_rust(node, out),
            Language::JavaScript | Language::TypeScript | Language::Tsx => {
                self.visit_js(node, out);
            }
            _ => {}
        }
    }

    fn visit_python(&self, node: Node, out: &mut Vec<ChunkBoundary>) {
        match node.kind() {
            "class_definition" => {
                out.push(self.boundary(node, ChunkKind::Class, "name"));
            }
            "function_definition" => {
                out.push(self.boundary(node, ChunkKind::Function, "name"));
                // Nested helpers become their own (contained) chunks.
                self.visit_children(node, out);
            }
            _ => self.visit_children(node, out),
        }
    }

    fn visit_rust(&self, node: Node, out: &mut Vec<ChunkBoundary>) {
        match node.kind() {
            "function_item" => {
                out.push(self.boundary(node, ChunkKind::Function, "name"));
            }
            "struct_item" | "enum_item" | "union_item" | "trait_item" => {
                out.push(self.boundary(node, ChunkKind::Class, "name"));
            }
            "impl_item" => {
                out.push(self.boundary(node, ChunkKind::Class, "type"));
            }
            "source_file" | "mod_item" | "declaration_list" => self.visit_children(node, out),
            _ => {}
        }
    }

    fn visit_js(&self, node: Node, out: &mut Vec<ChunkBoundary>) {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                out.push(self.boundary(node, ChunkKind::Function, "name"));
            }
            "class_declaration"
            | "abstract_class_declaration"
            | "interface_declaration"
            | "enum_declaration" => {
                out.push(self.boundary(node, ChunkKind::Class, "name"));
            }
            "variable_declarator" => {
                let is_function_value = node
                    .child_by_field_name("value")
                    .is_some_and(|value| {
                        matches!(value.kind(), "arrow_function" | "function_expression" | "function")
                    });
                if is_function_value {
                    out.push(self.boundary(node, ChunkKind::Function, "name"));
                }
            }
            "program" | "export_statement" | "lexical_declaration" | "variable_declaration" => {
                self.visit_children(node, out);
            }
            _ => {}
        }
    }

    fn boundary(&self, node: Node, kind: ChunkKind, name_field: &str) -> ChunkBoundary {
        let span = LineSpan::new(node.start_position().row + 1, node.end_position().row + 1);
        let name = node
            .child_by_field_name(name_field)
            .and_then(|name| name.utf8_text(self.content.as_bytes()).ok())
            .map(str::to_string)
            .unwrap_or_else(|| ANONYMOUS.to_string());
        ChunkBoundary::new(span, kind, name)
    }
}
