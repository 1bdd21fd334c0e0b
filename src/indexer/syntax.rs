//! Small helpers over the tree-sitter C# syntax tree shared by the type and
//! operation extractors.

use tree_sitter::Node;

#[derive(Clone)]
pub struct AttributeInfo<'a> {
    pub name: String,
    pub args: Vec<Node<'a>>,
}

pub struct CallTarget<'a> {
    pub receiver: Option<Node<'a>>,
    /// Member name without type arguments (`GetCollection` for `GetCollection<User>`).
    pub name: String,
    pub type_args: Vec<String>,
}

pub fn node_text(node: Node<'_>, source: &str) -> String {
    let start = node.start_byte();
    let end = node.end_byte();
    source.get(start..end).unwrap_or("").trim().to_string()
}

/// 1-based start and end lines.
pub fn line_span(node: Node<'_>) -> (i64, i64) {
    (
        node.start_position().row as i64 + 1,
        node.end_position().row as i64 + 1,
    )
}

pub fn has_modifier(node: Node<'_>, source: &str, keyword: &str) -> bool {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "modifier" && node_text(child, source) == keyword {
            return true;
        }
        if child.kind() == keyword {
            return true;
        }
    }
    false
}

pub fn attributes_for_node<'a>(node: Node<'a>, source: &str) -> Vec<AttributeInfo<'a>> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() != "attribute_list" {
            continue;
        }
        let mut list_cursor = child.walk();
        for attr in child.named_children(&mut list_cursor) {
            if attr.kind() != "attribute" {
                continue;
            }
            let Some(name_node) = attr.child_by_field_name("name") else {
                continue;
            };
            let raw_name = node_text(name_node, source);
            if raw_name.is_empty() {
                continue;
            }
            out.push(AttributeInfo {
                name: normalize_attribute_name(&raw_name),
                args: attribute_argument_exprs(attr),
            });
        }
    }
    out
}

fn attribute_argument_exprs(node: Node<'_>) -> Vec<Node<'_>> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() != "attribute_argument_list" {
            continue;
        }
        let mut arg_cursor = child.walk();
        for arg in child.named_children(&mut arg_cursor) {
            if arg.kind() != "attribute_argument" {
                continue;
            }
            if let Some(expr) = last_named_child(arg) {
                out.push(expr);
            }
        }
    }
    out
}

pub fn normalize_attribute_name(raw: &str) -> String {
    let name = raw.rsplit('.').next().unwrap_or(raw).trim();
    let name = name.split('<').next().unwrap_or(name);
    name.strip_suffix("Attribute").unwrap_or(name).to_string()
}

fn last_named_child(node: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = node.walk();
    let mut last = None;
    for child in node.named_children(&mut cursor) {
        last = Some(child);
    }
    last
}

pub fn call_arguments(node: Node<'_>) -> Vec<Node<'_>> {
    node.child_by_field_name("arguments")
        .map(argument_values)
        .unwrap_or_default()
}

pub fn argument_values(node: Node<'_>) -> Vec<Node<'_>> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() != "argument" {
            continue;
        }
        if let Some(expr) = last_named_child(child) {
            out.push(expr);
        }
    }
    out
}

/// Split the callee of an `invocation_expression` into receiver and member.
pub fn call_target<'a>(invocation: Node<'a>, source: &str) -> Option<CallTarget<'a>> {
    if invocation.kind() != "invocation_expression" {
        return None;
    }
    let function = invocation.child_by_field_name("function")?;
    match function.kind() {
        "member_access_expression" => {
            let receiver = function.child_by_field_name("expression");
            let name_node = function.child_by_field_name("name")?;
            let (name, type_args) = simple_name_parts(name_node, source);
            Some(CallTarget {
                receiver,
                name,
                type_args,
            })
        }
        "generic_name" | "identifier" => {
            let (name, type_args) = simple_name_parts(function, source);
            Some(CallTarget {
                receiver: None,
                name,
                type_args,
            })
        }
        _ => None,
    }
}

/// `Find` -> ("Find", []); `GetCollection<User>` -> ("GetCollection", ["User"]).
pub fn simple_name_parts(node: Node<'_>, source: &str) -> (String, Vec<String>) {
    if node.kind() == "generic_name" {
        let mut name = String::new();
        let mut args = Vec::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "identifier" if name.is_empty() => name = node_text(child, source),
                "type_argument_list" => {
                    let mut arg_cursor = child.walk();
                    for arg in child.named_children(&mut arg_cursor) {
                        let text = node_text(arg, source);
                        if !text.is_empty() {
                            args.push(text);
                        }
                    }
                }
                _ => {}
            }
        }
        if !name.is_empty() {
            return (name, args);
        }
        return split_generic_text(&node_text(node, source));
    }
    split_generic_text(&node_text(node, source))
}

pub fn split_generic_text(raw: &str) -> (String, Vec<String>) {
    let raw = raw.trim();
    let Some(open) = raw.find('<') else {
        return (raw.to_string(), Vec::new());
    };
    let name = raw[..open].trim().to_string();
    let inner = raw[open + 1..].trim_end().trim_end_matches('>');
    (name, split_top_level_commas(inner))
}

/// Split `a, Dictionary<b, c>` on commas that are not nested in `<>`/`()`.
pub fn split_top_level_commas(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '<' | '(' | '[' => {
                depth += 1;
                current.push(ch);
            }
            '>' | ')' | ']' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                let part = current.trim().to_string();
                if !part.is_empty() {
                    out.push(part);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let part = current.trim().to_string();
    if !part.is_empty() {
        out.push(part);
    }
    out
}

/// Last dotted segment with type arguments removed: `Acme.Models.User` -> `User`.
pub fn simple_type_name(raw: &str) -> String {
    let base = raw.trim().trim_end_matches('?');
    let base = match base.find('<') {
        Some(idx) => &base[..idx],
        None => base,
    };
    let base = base.rsplit("::").next().unwrap_or(base);
    base.rsplit('.').next().unwrap_or(base).trim().to_string()
}

pub fn extract_string_literal(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "string_literal" | "verbatim_string_literal" | "raw_string_literal" => {
            let raw = node_text(node, source);
            unquote_string_literal(&raw)
        }
        _ => None,
    }
}

fn unquote_string_literal(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let trimmed = trimmed.strip_suffix("u8").unwrap_or(trimmed);
    if let Some(rest) = trimmed.strip_prefix("@\"") {
        if rest.ends_with('"') {
            let value = &rest[..rest.len() - 1];
            return Some(value.replace("\"\"", "\""));
        }
    }
    let quote_count = trimmed.chars().take_while(|ch| *ch == '"').count();
    if quote_count >= 3 && trimmed.ends_with(&"\"".repeat(quote_count)) {
        let start = quote_count;
        let end = trimmed.len() - quote_count;
        if start <= end {
            return Some(trimmed[start..end].trim().to_string());
        }
    }
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        return Some(trimmed[1..trimmed.len() - 1].to_string());
    }
    None
}

/// All string literals under `node`, in source order.
pub fn string_literals(node: Node<'_>, source: &str) -> Vec<String> {
    let mut out = Vec::new();
    collect_string_literals(node, source, &mut out);
    out
}

fn collect_string_literals(node: Node<'_>, source: &str, out: &mut Vec<String>) {
    if let Some(value) = extract_string_literal(node, source) {
        out.push(value);
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_string_literals(child, source, out);
    }
}

pub fn integer_literal(node: Node<'_>, source: &str) -> Option<i64> {
    if node.kind() != "integer_literal" {
        return None;
    }
    let raw = node_text(node, source).replace('_', "");
    let digits = raw.trim_end_matches(|ch: char| ch.is_ascii_alphabetic());
    digits.parse().ok()
}

pub fn namespace_name(node: Node<'_>, source: &str) -> Option<String> {
    node.child_by_field_name("name")
        .map(|n| node_text(n, source))
        .filter(|value| !value.is_empty())
}

pub fn namespace_parts(name: &str) -> Vec<String> {
    let normalized = name.replace("::", ".");
    normalized
        .split('.')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().to_string())
        .collect()
}

pub fn base_list_types(node: Node<'_>, source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() != "base_list" {
            continue;
        }
        let mut base_cursor = child.walk();
        for base in child.named_children(&mut base_cursor) {
            let target = match base.kind() {
                "argument_list" => continue,
                "primary_constructor_base_type" => base.child_by_field_name("type").unwrap_or(base),
                _ => base,
            };
            let name = node_text(target, source);
            if !name.is_empty() {
                out.push(name);
            }
        }
    }
    out
}

/// Initializer expression of a `variable_declarator`, across grammar versions.
pub fn declarator_initializer(node: Node<'_>) -> Option<Node<'_>> {
    if let Some(init) = node.child_by_field_name("initializer") {
        return unwrap_equals_clause(init);
    }
    let name = node.child_by_field_name("name");
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if Some(child) == name || child.kind() == "bracketed_argument_list" {
            continue;
        }
        if child.kind() == "identifier" && name.is_none() {
            continue;
        }
        return unwrap_equals_clause(child);
    }
    None
}

fn unwrap_equals_clause(node: Node<'_>) -> Option<Node<'_>> {
    if node.kind() == "equals_value_clause" {
        let mut cursor = node.walk();
        return node.named_children(&mut cursor).next();
    }
    Some(node)
}

pub fn declarator_name(node: Node<'_>, source: &str) -> Option<String> {
    let name_node = node.child_by_field_name("name").or_else(|| {
        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .find(|child| child.kind() == "identifier")
    })?;
    let name = node_text(name_node, source);
    if name.is_empty() { None } else { Some(name) }
}

/// `(type, declarators)` of a `variable_declaration` node.
pub fn variable_declaration_parts<'a>(node: Node<'a>) -> (Option<Node<'a>>, Vec<Node<'a>>) {
    let type_node = node.child_by_field_name("type");
    let mut declarators = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "variable_declarator" {
            declarators.push(child);
        }
    }
    (type_node, declarators)
}

pub fn child_of_kind<'a>(node: Node<'a>, kind: &str) -> Option<Node<'a>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .find(|child| child.kind() == kind)
}

pub fn is_lambda(kind: &str) -> bool {
    matches!(
        kind,
        "lambda_expression" | "simple_lambda_expression" | "parenthesized_lambda_expression"
    )
}

/// Name of the first lambda parameter (`u` in `u => u.Id == id`).
pub fn lambda_parameter(node: Node<'_>, source: &str) -> Option<String> {
    let params = node
        .child_by_field_name("parameters")
        .or_else(|| node.child_by_field_name("parameter"))
        .map(|params| node_text(params, source))
        .or_else(|| {
            let text = node_text(node, source);
            text.split("=>").next().map(|head| head.to_string())
        })?;
    let inner = params.trim().trim_start_matches('(').trim_end_matches(')');
    let first = inner.split(',').next()?.trim();
    let name = first.rsplit(char::is_whitespace).next()?.trim();
    if name.is_empty() || !name.chars().all(|ch| ch.is_alphanumeric() || ch == '_') {
        None
    } else {
        Some(name.to_string())
    }
}

pub fn lambda_body(node: Node<'_>) -> Option<Node<'_>> {
    node.child_by_field_name("body").or_else(|| last_named_child(node))
}

/// Nearest enclosing member (method, constructor, accessor, local function).
pub fn enclosing_member(node: Node<'_>) -> Option<Node<'_>> {
    let mut current = node.parent();
    while let Some(parent) = current {
        match parent.kind() {
            "method_declaration"
            | "constructor_declaration"
            | "local_function_statement"
            | "property_declaration"
            | "operator_declaration"
            | "global_statement" => return Some(parent),
            "class_declaration" | "struct_declaration" | "record_declaration" => return None,
            _ => {}
        }
        current = parent.parent();
    }
    None
}

/// Initializer of the local `name` declared in the member enclosing `from`,
/// declared before `from`.
pub fn resolve_local_initializer<'a>(from: Node<'a>, name: &str, source: &str) -> Option<Node<'a>> {
    let member = enclosing_member(from)?;
    let mut found = None;
    find_local_initializer(member, name, from.start_byte(), source, &mut found);
    found
}

fn find_local_initializer<'a>(
    node: Node<'a>,
    name: &str,
    before: usize,
    source: &str,
    found: &mut Option<Node<'a>>,
) {
    if node.start_byte() >= before {
        return;
    }
    if node.kind() == "variable_declarator" && declarator_name(node, source).as_deref() == Some(name)
    {
        if let Some(init) = declarator_initializer(node) {
            *found = Some(init);
        }
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        find_local_initializer(child, name, before, source, found);
    }
}

pub fn strip_this(raw: &str) -> &str {
    raw.trim().strip_prefix("this.").unwrap_or(raw.trim())
}
