//! Syntactic shapes of query arguments. Nothing is evaluated: a shape records
//! which document fields and which operators an expression mentions.

use crate::indexer::syntax::{
    call_arguments, call_target, extract_string_literal, is_lambda, lambda_body, lambda_parameter,
    node_text, resolve_local_initializer, string_literals,
};
use crate::model::ExpressionShape;
use crate::util::compact_snippet;
use tree_sitter::Node;

pub const MAX_SHAPE_TEXT: usize = 200;
const MAX_INDIRECTION: usize = 3;

const BUILDER_OPERATORS: &[&str] = &[
    // filters
    "Eq", "Ne", "Gt", "Gte", "Lt", "Lte", "In", "Nin", "AnyEq", "AnyNe", "AnyGt", "AnyGte",
    "AnyLt", "AnyLte", "AnyIn", "AnyNin", "All", "Size", "SizeGt", "SizeLt", "Exists", "Type",
    "Regex", "Text", "ElemMatch", "And", "Or", "Not", "Where", "Near", "NearSphere",
    "GeoWithin", "GeoIntersects", "Mod", "OfType", "BitsAllSet", "BitsAnySet",
    // sorts
    "Ascending", "Descending", "MetaTextScore",
    // projections
    "Include", "Exclude", "Slice", "Expression",
    // updates
    "Set", "SetOnInsert", "Unset", "Inc", "Mul", "Min", "Max", "Push", "PushEach", "Pull",
    "PullAll", "PullFilter", "AddToSet", "AddToSetEach", "PopFirst", "PopLast", "Rename",
    "CurrentDate", "BitwiseAnd", "BitwiseOr", "BitwiseXor", "Combine",
];

const COMPARISON_OPERATORS: &[&str] = &["==", "!=", ">", ">=", "<", "<="];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRole {
    Filter,
    Sort,
    Projection,
    Update,
}

pub fn filter_shape(node: Node<'_>, source: &str) -> ExpressionShape {
    describe(node, source, ShapeRole::Filter, 0)
}

pub fn sort_shape(node: Node<'_>, source: &str) -> ExpressionShape {
    describe(node, source, ShapeRole::Sort, 0)
}

pub fn projection_shape(node: Node<'_>, source: &str) -> ExpressionShape {
    describe(node, source, ShapeRole::Projection, 0)
}

pub fn update_shape(node: Node<'_>, source: &str) -> ExpressionShape {
    describe(node, source, ShapeRole::Update, 0)
}

/// `SortBy(x => x.Name)` / `OrderByDescending(x => x.CreatedAt)`.
pub fn key_selector_shape(node: Node<'_>, source: &str, direction: &str) -> ExpressionShape {
    let text = compact_snippet(&node_text(node, source), MAX_SHAPE_TEXT);
    let fields = member_path(node, source).into_iter().collect::<Vec<_>>();
    let summary = if fields.is_empty() {
        format!("{direction} by expression")
    } else {
        format!("{direction} by {}", fields.join(", "))
    };
    ExpressionShape {
        summary,
        fields,
        operators: vec![direction.to_string()],
        text,
    }
}

/// Union of two shapes, in order; used when a chain refines a shape (`Where`
/// after `Where`, `ThenBy` after `SortBy`).
pub fn merge(existing: Option<ExpressionShape>, next: ExpressionShape) -> ExpressionShape {
    let Some(mut current) = existing else {
        return next;
    };
    if current.is_empty() {
        return next;
    }
    if next.is_empty() {
        return current;
    }
    for field in next.fields {
        push_unique(&mut current.fields, field);
    }
    for op in next.operators {
        push_unique(&mut current.operators, op);
    }
    current.summary = format!("{} then {}", current.summary, next.summary);
    let text = format!("{} | {}", current.text, next.text);
    current.text = compact_snippet(&text, MAX_SHAPE_TEXT);
    current
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !value.is_empty() && !values.contains(&value) {
        values.push(value);
    }
}

fn describe(node: Node<'_>, source: &str, role: ShapeRole, depth: usize) -> ExpressionShape {
    let text = compact_snippet(&node_text(node, source), MAX_SHAPE_TEXT);
    if is_empty_expression(node, source, &text) {
        return ExpressionShape {
            text,
            ..ExpressionShape::empty()
        };
    }
    match node.kind() {
        "parenthesized_expression" => {
            let mut cursor = node.walk();
            if let Some(inner) = node.named_children(&mut cursor).next() {
                return describe(inner, source, role, depth);
            }
        }
        "identifier" => {
            let name = node_text(node, source);
            if depth < MAX_INDIRECTION {
                if let Some(init) = resolve_local_initializer(node, &name, source) {
                    let mut inner = describe(init, source, role, depth + 1);
                    inner.summary = format!("{} (via {name})", inner.summary);
                    return inner;
                }
            }
            return ExpressionShape {
                summary: format!("variable {name}"),
                text,
                ..Default::default()
            };
        }
        kind if is_lambda(kind) => return lambda_shape(node, source, role, text),
        "string_literal" | "verbatim_string_literal" | "raw_string_literal" => {
            if let Some(json) = extract_string_literal(node, source) {
                return json_shape(&json, text);
            }
        }
        _ => {}
    }

    if let Some(json) = parsed_document_literal(node, source) {
        return json_shape(&json, text);
    }
    let mut fields = Vec::new();
    let mut operators = Vec::new();
    collect_builder_calls(node, source, &mut fields, &mut operators);
    if !operators.is_empty() {
        return ExpressionShape {
            summary: summarize("builder", &fields, &operators),
            fields,
            operators,
            text,
        };
    }
    collect_document_keys(node, source, &mut fields, &mut operators);
    if !fields.is_empty() || !operators.is_empty() {
        return ExpressionShape {
            summary: summarize("document", &fields, &operators),
            fields,
            operators,
            text,
        };
    }
    let summary = match role {
        ShapeRole::Filter => "opaque filter expression",
        ShapeRole::Sort => "opaque sort expression",
        ShapeRole::Projection => "opaque projection expression",
        ShapeRole::Update => "opaque update expression",
    };
    ExpressionShape {
        summary: summary.to_string(),
        text,
        ..Default::default()
    }
}

fn is_empty_expression(node: Node<'_>, source: &str, text: &str) -> bool {
    if is_lambda(node.kind()) {
        return lambda_body(node)
            .map(|body| node_text(body, source) == "true")
            .unwrap_or(false);
    }
    let squashed: String = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    squashed.ends_with(".Empty")
        || squashed == "newBsonDocument()"
        || squashed == "\"{}\""
        || squashed == "newBsonDocument{}"
}

fn lambda_shape(node: Node<'_>, source: &str, role: ShapeRole, text: String) -> ExpressionShape {
    let Some(param) = lambda_parameter(node, source) else {
        return ExpressionShape {
            summary: "lambda".to_string(),
            text,
            ..Default::default()
        };
    };
    let mut fields = Vec::new();
    let mut operators = Vec::new();
    if let Some(body) = lambda_body(node) {
        collect_lambda_refs(body, &param, source, &mut fields, &mut operators);
    }
    let summary = match role {
        ShapeRole::Filter if fields.len() == 1
            && operators
                .iter()
                .any(|op| COMPARISON_OPERATORS.contains(&op.as_str())) =>
        {
            format!("lambda comparing field {}", fields[0])
        }
        ShapeRole::Projection if !fields.is_empty() => {
            format!("projection of fields {}", fields.join(", "))
        }
        ShapeRole::Sort if !fields.is_empty() => format!("ordered by {}", fields.join(", ")),
        _ if fields.is_empty() => "lambda without field references".to_string(),
        _ => format!("lambda over fields {}", fields.join(", ")),
    };
    ExpressionShape {
        summary,
        fields,
        operators,
        text,
    }
}

fn collect_lambda_refs(
    node: Node<'_>,
    param: &str,
    source: &str,
    fields: &mut Vec<String>,
    operators: &mut Vec<String>,
) {
    match node.kind() {
        "invocation_expression" => {
            if let Some(target) = call_target(node, source) {
                if let Some(receiver) = target.receiver {
                    push_unique(operators, target.name.clone());
                    collect_lambda_refs(receiver, param, source, fields, operators);
                }
            }
            for arg in call_arguments(node) {
                collect_lambda_refs(arg, param, source, fields, operators);
            }
            return;
        }
        "member_access_expression" => {
            let text = node_text(node, source);
            let prefix = format!("{param}.");
            if let Some(rest) = text.strip_prefix(&prefix) {
                if is_member_path(rest) {
                    push_unique(fields, rest.to_string());
                    return;
                }
            }
        }
        "binary_expression" => {
            if let Some(op) = node.child_by_field_name("operator") {
                push_unique(operators, node_text(op, source));
            }
        }
        "prefix_unary_expression" => {
            if node_text(node, source).starts_with('!') {
                push_unique(operators, "!".to_string());
            }
        }
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_lambda_refs(child, param, source, fields, operators);
    }
}

fn is_member_path(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '.')
}

/// `x => x.Address.City` -> `Address.City`; a string literal is its own path.
pub fn member_path(node: Node<'_>, source: &str) -> Option<String> {
    if let Some(value) = extract_string_literal(node, source) {
        return Some(value);
    }
    if !is_lambda(node.kind()) {
        return None;
    }
    let param = lambda_parameter(node, source)?;
    let body = lambda_body(node)?;
    let text = node_text(body, source);
    let rest = text.strip_prefix(&format!("{param}."))?;
    if is_member_path(rest) {
        Some(rest.to_string())
    } else {
        let mut fields = Vec::new();
        let mut operators = Vec::new();
        collect_lambda_refs(body, &param, source, &mut fields, &mut operators);
        fields.into_iter().next()
    }
}

fn collect_builder_calls(
    node: Node<'_>,
    source: &str,
    fields: &mut Vec<String>,
    operators: &mut Vec<String>,
) {
    match node.kind() {
        "invocation_expression" => {
            if let Some(target) = call_target(node, source) {
                if BUILDER_OPERATORS.contains(&target.name.as_str()) {
                    push_unique(operators, target.name.clone());
                    if let Some(first) = call_arguments(node).first() {
                        if let Some(path) = member_path(*first, source) {
                            push_unique(fields, path);
                        }
                    }
                }
            }
        }
        "binary_expression" => {
            if let Some(op) = node.child_by_field_name("operator") {
                match node_text(op, source).as_str() {
                    "&" => push_unique(operators, "and".to_string()),
                    "|" => push_unique(operators, "or".to_string()),
                    _ => {}
                }
            }
        }
        "prefix_unary_expression" => {
            if node_text(node, source).starts_with('!') {
                push_unique(operators, "not".to_string());
            }
        }
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_builder_calls(child, source, fields, operators);
    }
}

/// Keys of `BsonDocument`/`BsonElement` construction, in source order.
/// `$`-prefixed keys are operators, everything else is a field.
pub fn collect_document_keys(
    node: Node<'_>,
    source: &str,
    fields: &mut Vec<String>,
    operators: &mut Vec<String>,
) {
    for (key, _) in document_pairs(node, source) {
        if key.starts_with('$') {
            push_unique(operators, key);
        } else {
            push_unique(fields, key);
        }
    }
}

/// `(key, literal value)` pairs of BSON document construction under `node`.
pub fn document_pairs(node: Node<'_>, source: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    collect_document_pairs(node, source, &mut out);
    out
}

fn collect_document_pairs(node: Node<'_>, source: &str, out: &mut Vec<(String, Option<String>)>) {
    if let Some((key, value)) = document_pair(node, source) {
        let literal = value.and_then(|v| extract_string_literal(v, source));
        out.push((key, literal));
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_document_pairs(child, source, out);
    }
}

/// One key/value of a BSON document: `new BsonDocument("k", v)`,
/// `new BsonElement("k", v)`, `{ "k", v }` inside a collection initializer, or
/// `["k"] = v` inside an object initializer.
pub fn document_pair<'a>(node: Node<'a>, source: &str) -> Option<(String, Option<Node<'a>>)> {
    match node.kind() {
        "object_creation_expression" => {
            let ty = node
                .child_by_field_name("type")
                .map(|ty| node_text(ty, source))
                .unwrap_or_default();
            if !ty.ends_with("BsonDocument") && !ty.ends_with("BsonElement") {
                return None;
            }
            let args = call_arguments(node);
            if args.len() < 2 {
                return None;
            }
            let key = extract_string_literal(args[0], source)?;
            Some((key, Some(args[1])))
        }
        "initializer_expression" => {
            let parent = node.parent()?;
            if parent.kind() != "initializer_expression" {
                return None;
            }
            let mut cursor = node.walk();
            let children: Vec<Node<'a>> = node.named_children(&mut cursor).collect();
            if children.len() < 2 {
                return None;
            }
            let key = extract_string_literal(children[0], source)?;
            Some((key, Some(children[1])))
        }
        "assignment_expression" => {
            let left = node.child_by_field_name("left")?;
            if !left.kind().contains("element_access") {
                return None;
            }
            let key = string_literals(left, source).into_iter().next()?;
            Some((key, node.child_by_field_name("right")))
        }
        _ => None,
    }
}

/// `BsonDocument.Parse("{ ... }")` -> the JSON text.
fn parsed_document_literal(node: Node<'_>, source: &str) -> Option<String> {
    let target = call_target(node, source)?;
    if target.name != "Parse" {
        return None;
    }
    let receiver = target.receiver.map(|r| node_text(r, source)).unwrap_or_default();
    if !receiver.ends_with("BsonDocument") {
        return None;
    }
    let first = *call_arguments(node).first()?;
    extract_string_literal(first, source)
}

fn json_shape(json: &str, text: String) -> ExpressionShape {
    let mut fields = Vec::new();
    let mut operators = Vec::new();
    for (key, _) in json_pairs(json) {
        if key.starts_with('$') {
            push_unique(&mut operators, key);
        } else {
            push_unique(&mut fields, key);
        }
    }
    if fields.is_empty() && operators.is_empty() {
        return ExpressionShape {
            text,
            ..ExpressionShape::empty()
        };
    }
    ExpressionShape {
        summary: summarize("json", &fields, &operators),
        fields,
        operators,
        text,
    }
}

/// Keys (and quoted scalar values) of a relaxed JSON/shell document, in order.
/// Keys may be quoted or bare; nesting is flattened.
pub fn json_pairs(json: &str) -> Vec<(String, Option<String>)> {
    let chars: Vec<char> = json.chars().collect();
    let mut tokens: Vec<(String, bool)> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' || ch == '\'' {
            let mut j = i + 1;
            let mut value = String::new();
            while j < chars.len() && chars[j] != ch {
                if chars[j] == '\\' && j + 1 < chars.len() {
                    j += 1;
                }
                value.push(chars[j]);
                j += 1;
            }
            tokens.push((value, true));
            i = j + 1;
        } else if ch.is_alphanumeric() || ch == '$' || ch == '_' {
            let mut j = i;
            let mut value = String::new();
            while j < chars.len()
                && (chars[j].is_alphanumeric() || matches!(chars[j], '$' | '_' | '.'))
            {
                value.push(chars[j]);
                j += 1;
            }
            tokens.push((value, false));
            i = j;
        } else if ch == ':' {
            tokens.push((":".to_string(), false));
            i += 1;
        } else {
            if !ch.is_whitespace() {
                tokens.push((ch.to_string(), false));
            }
            i += 1;
        }
    }

    let mut out = Vec::new();
    let mut idx = 0;
    while idx + 1 < tokens.len() {
        let (key, _) = &tokens[idx];
        let is_colon = tokens[idx + 1].0 == ":" && !tokens[idx + 1].1;
        if is_colon && key != ":" && !key.is_empty() {
            let value = tokens
                .get(idx + 2)
                .filter(|(_, quoted)| *quoted)
                .map(|(value, _)| value.clone());
            out.push((key.clone(), value));
            idx += 2;
            continue;
        }
        idx += 1;
    }
    out
}

fn summarize(origin: &str, fields: &[String], operators: &[String]) -> String {
    match (fields.is_empty(), operators.is_empty()) {
        (false, false) => format!("{origin} {} on {}", operators.join(","), fields.join(", ")),
        (false, true) => format!("{origin} over {}", fields.join(", ")),
        (true, false) => format!("{origin} {}", operators.join(",")),
        (true, true) => origin.to_string(),
    }
}
