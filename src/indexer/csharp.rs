use crate::error::{Error, Result};
use crate::indexer::extract::ExtractedFile;
use crate::indexer::operations::{self, HandleBinding};
use crate::indexer::syntax::{namespace_name, namespace_parts, node_text};
use crate::indexer::types;
use crate::model::OperationKind;
use std::collections::{HashMap, HashSet};
use tree_sitter::{Node, Parser};

/// Lexical position while walking: enclosing namespaces and types, the member
/// operations are attributed to, and the collection handles visible there.
#[derive(Clone, Default)]
pub(crate) struct Context {
    pub namespace_stack: Vec<String>,
    pub type_stack: Vec<String>,
    pub current_scope: String,
    pub handles: HashMap<String, HandleBinding>,
}

impl Context {
    /// Namespace plus outer type names, dot-joined.
    pub fn container_path(&self) -> String {
        let mut parts = self.namespace_stack.clone();
        parts.extend(self.type_stack.iter().cloned());
        parts.join(".")
    }

    fn qualify(&self, name: &str) -> String {
        let container = self.container_path();
        if container.is_empty() {
            name.to_string()
        } else {
            format!("{container}.{name}")
        }
    }
}

/// Per-file facts that do not change while walking.
pub(crate) struct FileContext<'s> {
    pub source: &'s str,
    pub rel_path: &'s str,
    pub nullable_enabled: bool,
    /// Enums and structs declared in this file.
    pub value_types: HashSet<String>,
}

pub struct CSharpExtractor {
    parser: Parser,
}

impl CSharpExtractor {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let language = tree_sitter_c_sharp::LANGUAGE;
        parser
            .set_language(&language.into())
            .map_err(|err| Error::invalid_argument(format!("c# grammar: {err}")))?;
        Ok(Self { parser })
    }

    pub fn extract(&mut self, source: &str, rel_path: &str) -> Result<ExtractedFile> {
        let Some(tree) = self.parser.parse(source, None) else {
            return Err(Error::Parse {
                path: rel_path.to_string(),
            });
        };
        let root = tree.root_node();
        let mut output = ExtractedFile {
            partial: root.has_error(),
            ..Default::default()
        };
        if output.partial {
            tracing::debug!("{rel_path}: syntax errors, extracting best-effort");
        }

        let mut value_types = HashSet::new();
        collect_value_types(root, source, &mut value_types);
        let file = FileContext {
            source,
            rel_path,
            nullable_enabled: source.contains("#nullable enable"),
            value_types,
        };
        let ctx = Context::default();
        if root.kind() == "compilation_unit" {
            walk_compilation_unit(root, &ctx, &file, &mut output);
        } else {
            walk_node(root, &ctx, &file, &mut output);
        }
        assign_ordinals(&mut output);
        Ok(output)
    }
}

fn collect_value_types(node: Node<'_>, source: &str, out: &mut HashSet<String>) {
    if matches!(node.kind(), "enum_declaration" | "struct_declaration") {
        if let Some(name) = node.child_by_field_name("name") {
            out.insert(node_text(name, source));
        }
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_value_types(child, source, out);
    }
}

/// Number operations by kind within each member, in lexical order.
fn assign_ordinals(output: &mut ExtractedFile) {
    output
        .operations
        .sort_by_key(|op| (op.span.start_line, op.span.end_line));
    let mut seen: HashMap<(String, OperationKind), usize> = HashMap::new();
    for op in &mut output.operations {
        let counter = seen.entry((op.span.symbol.clone(), op.kind)).or_insert(0);
        op.ordinal = *counter;
        *counter += 1;
    }
}

fn walk_compilation_unit(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    output: &mut ExtractedFile,
) {
    let mut next_ctx = ctx.clone();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "file_scoped_namespace_declaration" {
            if let Some(name) = namespace_name(child, file.source) {
                next_ctx.namespace_stack = namespace_parts(&name);
                next_ctx.current_scope = next_ctx.namespace_stack.join(".");
            }
            break;
        }
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "file_scoped_namespace_declaration" {
            // Older grammars nest the declarations under the namespace node.
            let mut inner = child.walk();
            for grandchild in child.named_children(&mut inner) {
                if grandchild.kind() != "qualified_name" && grandchild.kind() != "identifier" {
                    walk_node(grandchild, &next_ctx, file, output);
                }
            }
            continue;
        }
        walk_node(child, &next_ctx, file, output);
    }
}

fn walk_node(node: Node<'_>, ctx: &Context, file: &FileContext<'_>, output: &mut ExtractedFile) {
    if node.kind() == "invocation_expression" {
        operations::handle_invocation(node, ctx, file, output);
    }
    match node.kind() {
        "namespace_declaration" => {
            handle_namespace(node, ctx, file, output);
            return;
        }
        "class_declaration"
        | "struct_declaration"
        | "record_declaration"
        | "record_struct_declaration" => {
            handle_type(node, ctx, file, output);
            return;
        }
        "interface_declaration" | "enum_declaration" | "delegate_declaration" => return,
        "method_declaration"
        | "constructor_declaration"
        | "local_function_statement"
        | "property_declaration"
        | "operator_declaration" => {
            handle_member(node, ctx, file, output);
            return;
        }
        "field_declaration" => types::collect_constants(node, ctx, file, output),
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        walk_node(child, ctx, file, output);
    }
}

fn handle_namespace(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    output: &mut ExtractedFile,
) {
    let Some(name) = namespace_name(node, file.source) else {
        return;
    };
    let parts = namespace_parts(&name);
    if parts.is_empty() {
        return;
    }
    let mut next_ctx = ctx.clone();
    next_ctx.namespace_stack.extend(parts);
    next_ctx.current_scope = next_ctx.namespace_stack.join(".");
    if let Some(body) = node.child_by_field_name("body") {
        let mut cursor = body.walk();
        for child in body.named_children(&mut cursor) {
            walk_node(child, &next_ctx, file, output);
        }
    }
}

fn handle_type(node: Node<'_>, ctx: &Context, file: &FileContext<'_>, output: &mut ExtractedFile) {
    let Some(name_node) = node.child_by_field_name("name") else {
        return;
    };
    let name = node_text(name_node, file.source);
    if name.is_empty() {
        return;
    }
    types::extract_type(node, ctx, file, output);

    let mut next_ctx = ctx.clone();
    next_ctx.current_scope = ctx.qualify(&name);
    next_ctx.type_stack.push(name);
    next_ctx
        .handles
        .extend(operations::collect_type_handles(node, file));
    if let Some(body) = node.child_by_field_name("body") {
        let mut cursor = body.walk();
        for child in body.named_children(&mut cursor) {
            walk_node(child, &next_ctx, file, output);
        }
    }
}

fn handle_member(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    output: &mut ExtractedFile,
) {
    let name = node
        .child_by_field_name("name")
        .map(|n| node_text(n, file.source))
        .filter(|n| !n.is_empty())
        .or_else(|| {
            ctx.type_stack
                .last()
                .filter(|_| node.kind() == "constructor_declaration")
                .map(|_| ".ctor".to_string())
        })
        .unwrap_or_else(|| node.kind().to_string());
    let mut next_ctx = ctx.clone();
    if node.kind() == "local_function_statement" {
        next_ctx.current_scope = format!("{}.{}", ctx.current_scope, name);
    } else {
        next_ctx.current_scope = ctx.qualify(&name);
    }
    next_ctx
        .handles
        .extend(operations::collect_member_handles(node, file));
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        walk_node(child, &next_ctx, file, output);
    }
}
