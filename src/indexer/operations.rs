//! Query operation extraction: calls on typed collection handles, classified
//! by member name, with their argument shapes and fluent chains.

use crate::indexer::csharp::{Context, FileContext};
use crate::indexer::extract::{ExtractedFile, HintSite, OperationInput};
use crate::indexer::shape::{self, MAX_SHAPE_TEXT};
use crate::indexer::stages::{self, UNRESOLVED_PIPELINE};
use crate::indexer::syntax::{
    call_arguments, call_target, child_of_kind, declarator_initializer, declarator_name,
    enclosing_member, extract_string_literal, integer_literal, line_span, node_text,
    simple_type_name, split_generic_text, string_literals, strip_this, variable_declaration_parts,
};
use crate::model::{AggregationStage, CollectionHint, ExpressionShape, OperationKind, SourceSpan};
use crate::util::compact_snippet;
use std::collections::HashMap;
use tree_sitter::Node;

const HANDLE_TYPES: &[&str] = &["IMongoCollection", "MongoCollectionBase", "MongoCollection"];
const CONFIG_GETTERS: &[&str] = &["GetValue", "GetSection", "GetRequiredSection"];

/// What a collection handle variable is known to point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleBinding {
    pub document_type: String,
    pub hint: Option<CollectionHint>,
}

/// `IMongoCollection<Acme.User>` -> `User`.
pub fn handle_document_type(type_text: &str) -> Option<String> {
    let compact: String = type_text.chars().filter(|ch| !ch.is_whitespace()).collect();
    let (name, args) = split_generic_text(&compact);
    if args.len() != 1 || !HANDLE_TYPES.contains(&simple_type_name(&name).as_str()) {
        return None;
    }
    Some(simple_type_name(&args[0]))
}

/// Collection hint carried by an expression, as written.
pub(crate) fn hint_from_expr(node: Node<'_>, source: &str) -> Option<CollectionHint> {
    if let Some(value) = extract_string_literal(node, source) {
        return Some(CollectionHint::Literal(value));
    }
    match node.kind() {
        "parenthesized_expression" => {
            let mut cursor = node.walk();
            let inner = node.named_children(&mut cursor).next()?;
            hint_from_expr(inner, source)
        }
        "invocation_expression" => {
            let target = call_target(node, source)?;
            let args = call_arguments(node);
            if target.name == "nameof" && target.receiver.is_none() {
                let arg = node_text(*args.first()?, source);
                let last = arg.rsplit('.').next().unwrap_or(&arg).to_string();
                return Some(CollectionHint::Literal(last));
            }
            if CONFIG_GETTERS.contains(&target.name.as_str()) {
                let key = extract_string_literal(*args.first()?, source)?;
                return Some(CollectionHint::ConfigKey(key));
            }
            None
        }
        "element_access_expression" => {
            let subscript = node.child_by_field_name("subscript").unwrap_or(node);
            let key = string_literals(subscript, source).into_iter().next()?;
            Some(CollectionHint::ConfigKey(key))
        }
        "member_access_expression" => {
            let expression = node.child_by_field_name("expression");
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source))
                .unwrap_or_default();
            if name == "Value" {
                if let Some(inner) = expression.filter(|e| e.kind() == "invocation_expression") {
                    if let Some(hint @ CollectionHint::ConfigKey(_)) = hint_from_expr(inner, source)
                    {
                        return Some(hint);
                    }
                }
            }
            Some(CollectionHint::Identifier(strip_this(&node_text(node, source)).to_string()))
        }
        "identifier" => Some(CollectionHint::Identifier(node_text(node, source))),
        _ => None,
    }
}

/// `db.GetCollection<User>("users")` -> (`User`, hint argument).
fn get_collection_call<'a>(node: Node<'a>, source: &str) -> Option<(String, Option<Node<'a>>)> {
    let target = call_target(node, source)?;
    if target.name != "GetCollection" {
        return None;
    }
    let document_type = simple_type_name(target.type_args.first()?);
    Some((document_type, call_arguments(node).first().copied()))
}

fn binding_from_get_collection(node: Node<'_>, source: &str) -> Option<HandleBinding> {
    let (document_type, hint_arg) = get_collection_call(node, source)?;
    Some(HandleBinding {
        document_type,
        hint: hint_arg.and_then(|arg| hint_from_expr(arg, source)),
    })
}

/// First `GetCollection<T>(...)` call at or below `node`.
fn find_get_collection(node: Node<'_>, source: &str) -> Option<HandleBinding> {
    if node.kind() == "invocation_expression" {
        if let Some(binding) = binding_from_get_collection(node, source) {
            return Some(binding);
        }
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if let Some(binding) = find_get_collection(child, source) {
            return Some(binding);
        }
    }
    None
}

fn bind(
    handles: &mut HashMap<String, HandleBinding>,
    name: String,
    type_text: Option<&str>,
    initializer: Option<Node<'_>>,
    source: &str,
) {
    let from_init = initializer.and_then(|init| find_get_collection(init, source));
    let from_type = type_text.and_then(handle_document_type);
    let mut binding = match (from_type, from_init) {
        (Some(document_type), Some(init)) => HandleBinding {
            document_type,
            hint: init.hint,
        },
        (Some(document_type), None) => HandleBinding {
            document_type,
            hint: None,
        },
        (None, Some(init)) => init,
        (None, None) => return,
    };
    // A constructor assignment seen earlier may already have supplied the hint.
    if binding.hint.is_none() {
        binding.hint = handles.get(&name).and_then(|existing| existing.hint.clone());
    }
    handles.insert(name, binding);
}

/// Handles declared on a type: fields, properties, primary-constructor
/// parameters, and members assigned from `GetCollection<T>(...)` anywhere in
/// the type's own members.
pub(crate) fn collect_type_handles(
    type_node: Node<'_>,
    file: &FileContext<'_>,
) -> HashMap<String, HandleBinding> {
    let source = file.source;
    let mut handles = HashMap::new();
    if let Some(params) = child_of_kind(type_node, "parameter_list") {
        collect_parameter_handles(params, source, &mut handles);
    }
    let Some(body) = type_node.child_by_field_name("body") else {
        return handles;
    };
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        match member.kind() {
            "field_declaration" => {
                let Some(decl) = child_of_kind(member, "variable_declaration") else {
                    continue;
                };
                collect_declaration_handles(decl, source, &mut handles);
            }
            "property_declaration" => {
                let Some(name) = member
                    .child_by_field_name("name")
                    .map(|n| node_text(n, source))
                else {
                    continue;
                };
                let type_text = member
                    .child_by_field_name("type")
                    .map(|ty| node_text(ty, source));
                bind(&mut handles, name, type_text.as_deref(), Some(member), source);
            }
            "constructor_declaration" | "method_declaration" => {
                collect_assignments(member, source, &mut handles);
            }
            _ => {}
        }
    }
    handles
}

/// Handles visible only inside one member: parameters and locals.
pub(crate) fn collect_member_handles(
    member: Node<'_>,
    file: &FileContext<'_>,
) -> HashMap<String, HandleBinding> {
    let source = file.source;
    let mut handles = HashMap::new();
    if let Some(params) = member
        .child_by_field_name("parameters")
        .or_else(|| child_of_kind(member, "parameter_list"))
    {
        collect_parameter_handles(params, source, &mut handles);
    }
    collect_locals(member, source, &mut handles);
    handles
}

fn collect_parameter_handles(
    params: Node<'_>,
    source: &str,
    handles: &mut HashMap<String, HandleBinding>,
) {
    let mut cursor = params.walk();
    for param in params.named_children(&mut cursor) {
        if param.kind() != "parameter" {
            continue;
        }
        let Some(name) = param.child_by_field_name("name").map(|n| node_text(n, source)) else {
            continue;
        };
        let type_text = param.child_by_field_name("type").map(|ty| node_text(ty, source));
        bind(handles, name, type_text.as_deref(), None, source);
    }
}

fn collect_declaration_handles(
    decl: Node<'_>,
    source: &str,
    handles: &mut HashMap<String, HandleBinding>,
) {
    let (type_node, declarators) = variable_declaration_parts(decl);
    let type_text = type_node.map(|ty| node_text(ty, source));
    for declarator in declarators {
        let Some(name) = declarator_name(declarator, source) else {
            continue;
        };
        bind(
            handles,
            name,
            type_text.as_deref(),
            declarator_initializer(declarator),
            source,
        );
    }
}

fn collect_locals(node: Node<'_>, source: &str, handles: &mut HashMap<String, HandleBinding>) {
    match node.kind() {
        "variable_declaration" => {
            collect_declaration_handles(node, source, handles);
            return;
        }
        "class_declaration" | "struct_declaration" | "record_declaration" => return,
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_locals(child, source, handles);
    }
}

fn collect_assignments(node: Node<'_>, source: &str, handles: &mut HashMap<String, HandleBinding>) {
    if node.kind() == "assignment_expression" {
        if let (Some(left), Some(right)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
        ) {
            if let Some(binding) = find_get_collection(right, source) {
                let name = strip_this(&node_text(left, source)).to_string();
                let keep_type = handles
                    .get(&name)
                    .map(|existing| existing.document_type.clone());
                handles.insert(
                    name,
                    HandleBinding {
                        document_type: keep_type.unwrap_or(binding.document_type),
                        hint: binding.hint,
                    },
                );
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_assignments(child, source, handles);
    }
}

/// The handle a call receiver denotes: a bound name, `this.name`, the last
/// segment of a member access, or an inline `GetCollection<T>(...)` call.
pub(crate) fn binding_for_receiver(
    receiver: Node<'_>,
    handles: &HashMap<String, HandleBinding>,
    source: &str,
) -> Option<HandleBinding> {
    match receiver.kind() {
        "identifier" => handles.get(&node_text(receiver, source)).cloned(),
        "member_access_expression" => {
            let text = node_text(receiver, source);
            let name = strip_this(&text);
            if let Some(binding) = handles.get(name) {
                return Some(binding.clone());
            }
            let last = name.rsplit('.').next().unwrap_or(name);
            handles.get(last).cloned()
        }
        "invocation_expression" => binding_from_get_collection(receiver, source),
        "parenthesized_expression" => {
            let mut cursor = receiver.walk();
            let inner = receiver.named_children(&mut cursor).next()?;
            binding_for_receiver(inner, handles, source)
        }
        _ => None,
    }
}

struct ChainCall<'a> {
    name: String,
    args: Vec<Node<'a>>,
    node: Node<'a>,
}

/// Calls chained after `node`: `node.Sort(..).Limit(..).ToList()`.
fn chain_calls<'a>(node: Node<'a>, source: &str) -> Vec<ChainCall<'a>> {
    let mut out = Vec::new();
    let mut current = node;
    loop {
        let Some(parent) = current.parent() else {
            break;
        };
        if parent.kind() != "member_access_expression"
            || parent.child_by_field_name("expression") != Some(current)
        {
            break;
        }
        let Some(grand) = parent.parent() else {
            break;
        };
        if grand.kind() != "invocation_expression"
            || grand.child_by_field_name("function") != Some(parent)
        {
            break;
        }
        let Some(target) = call_target(grand, source) else {
            break;
        };
        out.push(ChainCall {
            name: target.name,
            args: call_arguments(grand),
            node: grand,
        });
        current = grand;
    }
    out
}

fn is_session_argument(node: Node<'_>, source: &str) -> bool {
    if !matches!(node.kind(), "identifier" | "member_access_expression") {
        return false;
    }
    let text = node_text(node, source);
    is_session_name(text.rsplit('.').next().unwrap_or(&text))
}

/// `session`, `clientSession`, `_mongoSession`; not `sessionFilter`.
fn is_session_name(name: &str) -> bool {
    let name = name.trim_start_matches('_');
    name.eq_ignore_ascii_case("session") || name.ends_with("Session")
}

/// Inside a `WithTransaction(...)` callback, or after `StartTransaction()` in
/// the same member.
fn inside_transaction(node: Node<'_>, source: &str) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if parent.kind() == "invocation_expression" {
            if let Some(target) = call_target(parent, source) {
                if target.name.starts_with("WithTransaction") {
                    return true;
                }
            }
        }
        current = parent.parent();
    }
    let Some(member) = enclosing_member(node) else {
        return false;
    };
    let start = member.start_byte();
    let before = source.get(start..node.start_byte()).unwrap_or("");
    before.contains(".StartTransaction(") || before.contains(".StartTransactionAsync(")
}

fn limit_value(args: &[Node<'_>], source: &str) -> Option<i64> {
    args.first().and_then(|arg| integer_literal(*arg, source))
}

pub(crate) fn handle_invocation(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    out: &mut ExtractedFile,
) {
    let source = file.source;
    let Some(target) = call_target(node, source) else {
        return;
    };
    if target.name == "GetCollection" {
        record_hint_site(node, ctx, file, out);
        return;
    }
    let Some(kind) = OperationKind::classify(&target.name) else {
        return;
    };
    let Some(receiver) = target.receiver else {
        return;
    };
    let Some(binding) = binding_for_receiver(receiver, &ctx.handles, source) else {
        return;
    };

    let args = call_arguments(node);
    let has_session = args
        .first()
        .map(|arg| is_session_argument(*arg, source))
        .unwrap_or(false);
    let offset = usize::from(has_session);
    let arg = |index: usize| args.get(offset + index).copied();
    let chain = chain_calls(node, source);
    let end_node = chain.last().map(|call| call.node).unwrap_or(node);
    let (start_line, _) = line_span(node);
    let (_, end_line) = line_span(end_node);

    let mut op = OperationInput::new(
        kind,
        SourceSpan {
            file_path: file.rel_path.to_string(),
            symbol: ctx.current_scope.clone(),
            start_line,
            end_line,
        },
    );
    op.document_type = Some(binding.document_type.clone());
    op.hint = binding.hint.clone();
    op.transactional = has_session || inside_transaction(node, source);

    let is_queryable = target.name.starts_with("AsQueryable");
    if kind.takes_filter() && !is_queryable {
        op.filter = Some(
            arg(0)
                .map(|filter| shape::filter_shape(filter, source))
                .unwrap_or_else(ExpressionShape::empty),
        );
    }
    if kind.is_update() {
        op.update = arg(1).map(|update| shape::update_shape(update, source));
    }
    match kind {
        OperationKind::Distinct => {
            op.projection = arg(0).map(|field| {
                let mut projection = shape::projection_shape(field, source);
                if let Some(path) = shape::member_path(field, source) {
                    projection.summary = format!("distinct {path}");
                    projection.fields = vec![path];
                }
                projection
            });
            op.filter = Some(
                arg(1)
                    .map(|filter| shape::filter_shape(filter, source))
                    .unwrap_or_else(ExpressionShape::empty),
            );
        }
        OperationKind::Aggregate => {
            let mut pipeline: Vec<AggregationStage> = arg(0)
                .map(|pipeline| stages::pipeline_stages(pipeline, &ctx.handles, source))
                .unwrap_or_default();
            for call in &chain {
                if let Some(stage) = stages::fluent_stage(&call.name, &call.args, &ctx.handles, source)
                {
                    pipeline.push(stage);
                }
            }
            if pipeline.is_empty() {
                let text = arg(0)
                    .map(|p| compact_snippet(&node_text(p, source), MAX_SHAPE_TEXT))
                    .unwrap_or_default();
                pipeline.push(AggregationStage {
                    operator: UNRESOLVED_PIPELINE.to_string(),
                    shape: ExpressionShape {
                        summary: "unresolved pipeline".to_string(),
                        text,
                        ..Default::default()
                    },
                    from_collection: None,
                    from_type: None,
                    local_field: None,
                    foreign_field: None,
                    output_field: None,
                });
            }
            op.stages = Some(pipeline);
        }
        _ => {}
    }
    if kind == OperationKind::Find {
        apply_find_chain(&mut op, &chain, source);
    }

    out.operations.push(op);
}

/// Fluent `Find` modifiers and LINQ operators after `AsQueryable()`.
fn apply_find_chain(op: &mut OperationInput, chain: &[ChainCall<'_>], source: &str) {
    for call in chain {
        let first = call.args.first().copied();
        let name = call.name.strip_suffix("Async").unwrap_or(&call.name);
        match name {
            "Where" => {
                if let Some(filter) = first {
                    op.filter = Some(shape::merge(
                        op.filter.take(),
                        shape::filter_shape(filter, source),
                    ));
                }
            }
            "Sort" => {
                if let Some(sort) = first {
                    op.sort = Some(shape::merge(op.sort.take(), shape::sort_shape(sort, source)));
                }
            }
            "SortBy" | "SortByDescending" | "OrderBy" | "OrderByDescending" | "ThenBy"
            | "ThenByDescending" => {
                if let Some(selector) = first {
                    let direction = if name.ends_with("Descending") {
                        "desc"
                    } else {
                        "asc"
                    };
                    op.sort = Some(shape::merge(
                        op.sort.take(),
                        shape::key_selector_shape(selector, source, direction),
                    ));
                }
            }
            "Limit" | "Take" => op.limit = limit_value(&call.args, source).or(op.limit),
            "Skip" => op.skip = limit_value(&call.args, source).or(op.skip),
            "Project" | "Select" => {
                if let Some(projection) = first {
                    op.projection = Some(shape::projection_shape(projection, source));
                }
            }
            "First" | "FirstOrDefault" | "Single" | "SingleOrDefault" | "Any" | "Count"
            | "CountDocuments" | "LongCount" => {
                // LINQ terminals may carry the predicate.
                if let Some(filter) = first {
                    op.filter = Some(shape::merge(
                        op.filter.take(),
                        shape::filter_shape(filter, source),
                    ));
                }
            }
            _ => {}
        }
    }
}

fn record_hint_site(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    out: &mut ExtractedFile,
) {
    let source = file.source;
    let Some((document_type, Some(hint_arg))) = get_collection_call(node, source) else {
        return;
    };
    let Some(hint) = hint_from_expr(hint_arg, source) else {
        return;
    };
    let (start_line, end_line) = line_span(node);
    out.hint_sites.push(HintSite {
        document_type,
        hint,
        context: compact_snippet(&node_text(node, source), 160),
        span: SourceSpan {
            file_path: file.rel_path.to_string(),
            symbol: ctx.current_scope.clone(),
            start_line,
            end_line,
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_types_unwrap_document_type() {
        assert_eq!(
            handle_document_type("IMongoCollection<User>").as_deref(),
            Some("User")
        );
        assert_eq!(
            handle_document_type("IMongoCollection< Shop.Models.Order >").as_deref(),
            Some("Order")
        );
        assert_eq!(handle_document_type("List<User>"), None);
        assert_eq!(handle_document_type("IMongoDatabase"), None);
    }

    #[test]
    fn session_names_match_whole_words() {
        assert!(is_session_name("session"));
        assert!(is_session_name("clientSession"));
        assert!(is_session_name("_mongoSession"));
        assert!(is_session_name("Session"));
        assert!(!is_session_name("sessionFilter"));
        assert!(!is_session_name("sessions"));
        assert!(!is_session_name("filter"));
    }
}
