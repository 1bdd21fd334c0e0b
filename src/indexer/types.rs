//! Document type extraction: which declarations are persisted shapes, their
//! members, nullability and BSON mapping attributes.

use crate::indexer::csharp::{Context, FileContext};
use crate::indexer::extract::{ConstantInput, ExtractedFile, HintSite, TypeInput};
use crate::indexer::operations;
use crate::indexer::syntax::{
    attributes_for_node, base_list_types, child_of_kind, declarator_initializer, declarator_name,
    extract_string_literal, has_modifier, line_span, node_text, simple_type_name,
    split_generic_text, variable_declaration_parts, AttributeInfo,
};
use crate::model::{Attribute, AttributeRole, FieldDefinition, SourceSpan};
use crate::util::compact_snippet;
use tree_sitter::Node;

const VALUE_TYPES: &[&str] = &[
    "bool", "byte", "sbyte", "short", "ushort", "int", "uint", "long", "ulong", "float",
    "double", "decimal", "char", "nint", "nuint", "Boolean", "Byte", "SByte", "Int16", "UInt16",
    "Int32", "UInt32", "Int64", "UInt64", "Single", "Double", "Decimal", "Char", "DateTime",
    "DateTimeOffset", "DateOnly", "TimeOnly", "TimeSpan", "Guid", "ObjectId", "Decimal128",
];

const COLLECTION_WRAPPERS: &[&str] = &[
    "List",
    "IList",
    "ICollection",
    "IEnumerable",
    "IReadOnlyList",
    "IReadOnlyCollection",
    "HashSet",
    "ISet",
    "IReadOnlySet",
    "Collection",
    "ReadOnlyCollection",
    "ObservableCollection",
    "SortedSet",
    "LinkedList",
    "Queue",
    "Stack",
    "ImmutableList",
    "ImmutableArray",
    "ImmutableHashSet",
];

const DRIVER_HANDLE_TYPES: &[&str] = &[
    "IMongoCollection",
    "MongoCollectionBase",
    "IMongoDatabase",
    "IMongoClient",
    "MongoClient",
];

/// Element type of a collection-typed declaration: `List<Address>` -> `Address`,
/// `Address[]` -> `Address`. `None` for scalars, strings and dictionaries.
pub fn collection_element_type(declared: &str) -> Option<String> {
    let declared = declared.trim().trim_end_matches('?').trim();
    if let Some(inner) = declared.strip_suffix("[]") {
        let inner = inner.trim();
        if inner.is_empty() {
            return None;
        }
        return Some(inner.to_string());
    }
    let (name, args) = split_generic_text(declared);
    let base = simple_type_name(&name);
    if args.len() == 1 && COLLECTION_WRAPPERS.contains(&base.as_str()) {
        return args.into_iter().next();
    }
    None
}

/// The type a member ultimately stores: collections unwrapped, `?` removed,
/// namespace dropped.
pub fn element_type_name(declared: &str) -> String {
    let inner = collection_element_type(declared).unwrap_or_else(|| declared.to_string());
    let inner = inner.trim().trim_end_matches('?');
    let (name, args) = split_generic_text(inner);
    if simple_type_name(&name) == "Nullable" && args.len() == 1 {
        return simple_type_name(&args[0]);
    }
    simple_type_name(inner)
}

pub fn is_value_type_name(name: &str) -> bool {
    VALUE_TYPES.contains(&name)
}

fn is_driver_handle_type(type_text: &str) -> bool {
    let (name, _) = split_generic_text(type_text);
    DRIVER_HANDLE_TYPES.contains(&simple_type_name(&name).as_str())
}

pub fn attribute_role(name: &str) -> Option<AttributeRole> {
    let role = match name {
        "BsonId" | "Key" => AttributeRole::Identity,
        "BsonElement" => AttributeRole::Rename,
        "BsonIgnore" => AttributeRole::Skip,
        "BsonRepresentation" => AttributeRole::Representation,
        "BsonRequired" => AttributeRole::Required,
        "BsonIgnoreIfNull" => AttributeRole::IgnoreIfNull,
        "BsonIgnoreIfDefault" => AttributeRole::IgnoreIfDefault,
        "BsonDefaultValue" => AttributeRole::DefaultValue,
        "BsonDateTimeOptions" => AttributeRole::DateTimeOptions,
        "BsonSerializer" => AttributeRole::Serializer,
        "BsonDiscriminator" => AttributeRole::Discriminator,
        "BsonKnownTypes" => AttributeRole::KnownTypes,
        "BsonIgnoreExtraElements" => AttributeRole::IgnoreExtraElements,
        "BsonNoId" => AttributeRole::NoId,
        "CollectionName" | "BsonCollection" | "MongoCollection" => AttributeRole::CollectionName,
        _ => return None,
    };
    Some(role)
}

fn structural_attributes(infos: &[AttributeInfo<'_>], source: &str) -> Vec<Attribute> {
    infos
        .iter()
        .filter_map(|info| {
            let role = attribute_role(&info.name)?;
            let arguments = info
                .args
                .iter()
                .map(|arg| attribute_argument_text(*arg, source))
                .filter(|value| !value.is_empty())
                .collect();
            Some(Attribute {
                name: info.name.clone(),
                role,
                arguments,
            })
        })
        .collect()
}

fn attribute_argument_text(node: Node<'_>, source: &str) -> String {
    if let Some(value) = extract_string_literal(node, source) {
        return value;
    }
    if node.kind() == "typeof_expression" {
        if let Some(ty) = node.child_by_field_name("type").or_else(|| {
            let mut cursor = node.walk();
            node.named_children(&mut cursor).next()
        }) {
            return simple_type_name(&node_text(ty, source));
        }
    }
    compact_snippet(&node_text(node, source), 120)
}

#[derive(Default)]
struct MemberCensus {
    data_members: usize,
    behaviour_members: usize,
    holds_driver_handle: bool,
}

/// Extract a document type from a class/struct/record declaration. Abstract,
/// static, data-access and behaviour-only declarations yield nothing.
pub(crate) fn extract_type(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    out: &mut ExtractedFile,
) {
    let source = file.source;
    let Some(name_node) = node.child_by_field_name("name") else {
        return;
    };
    let name = node_text(name_node, source);
    if name.is_empty() {
        return;
    }
    if has_modifier(node, source, "abstract") || has_modifier(node, source, "static") {
        tracing::debug!("{}: skip abstract/static type {}", file.rel_path, name);
        return;
    }

    let census = member_census(node, source);
    if census.holds_driver_handle {
        tracing::debug!("{}: skip data-access type {}", file.rel_path, name);
        return;
    }
    if census.data_members == 0 && census.behaviour_members > 0 {
        tracing::debug!("{}: skip behaviour-only type {}", file.rel_path, name);
        return;
    }

    let namespace = ctx.container_path();
    let type_attr_infos = attributes_for_node(node, source);
    let attributes = structural_attributes(&type_attr_infos, source);
    let mut fields = Vec::new();
    if node.kind() == "record_declaration" || node.kind() == "record_struct_declaration" {
        if let Some(params) = child_of_kind(node, "parameter_list") {
            collect_record_parameters(params, file, &mut fields);
        }
    }
    if let Some(body) = node.child_by_field_name("body") {
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            match member.kind() {
                "property_declaration" => collect_property(member, file, &mut fields),
                "field_declaration" => collect_fields(member, file, &mut fields),
                _ => {}
            }
        }
    }

    let mut discriminators = Vec::new();
    for attr in &attributes {
        match attr.role {
            AttributeRole::Discriminator => {
                let explicit = type_attr_infos
                    .iter()
                    .find(|info| info.name == attr.name)
                    .and_then(|info| info.args.first())
                    .and_then(|arg| extract_string_literal(*arg, source));
                if let Some(value) = explicit {
                    discriminators.push(value);
                }
            }
            AttributeRole::KnownTypes => {
                discriminators.extend(attr.arguments.iter().cloned());
            }
            _ => {}
        }
    }

    let base_type = base_list_types(node, source)
        .into_iter()
        .map(|base| simple_type_name(&base))
        .find(|base| !looks_like_interface(base));

    let (start_line, end_line) = line_span(node);
    let qualname = if namespace.is_empty() {
        name.clone()
    } else {
        format!("{namespace}.{name}")
    };
    let span = SourceSpan {
        file_path: file.rel_path.to_string(),
        symbol: qualname,
        start_line,
        end_line,
    };

    for info in type_attr_infos
        .iter()
        .filter(|info| attribute_role(&info.name) == Some(AttributeRole::CollectionName))
    {
        let Some(arg) = info.args.first() else {
            continue;
        };
        if let Some(hint) = operations::hint_from_expr(*arg, source) {
            out.hint_sites.push(HintSite {
                document_type: name.clone(),
                context: format!("[{}({})] on {}", info.name, hint, name),
                hint,
                span: span.clone(),
            });
        }
    }

    out.types.push(TypeInput {
        name,
        namespace,
        fields,
        attributes,
        discriminators,
        base_type,
        span,
    });
}

fn looks_like_interface(name: &str) -> bool {
    let mut chars = name.chars();
    matches!((chars.next(), chars.next()), (Some('I'), Some(second)) if second.is_ascii_uppercase())
}

fn member_census(node: Node<'_>, source: &str) -> MemberCensus {
    let mut census = MemberCensus::default();
    if let Some(params) = child_of_kind(node, "parameter_list") {
        let mut cursor = params.walk();
        for param in params.named_children(&mut cursor) {
            if param.kind() != "parameter" {
                continue;
            }
            let type_text = param
                .child_by_field_name("type")
                .map(|ty| node_text(ty, source))
                .unwrap_or_default();
            if is_driver_handle_type(&type_text) {
                census.holds_driver_handle = true;
            }
            if node.kind().starts_with("record") {
                census.data_members += 1;
            }
        }
    }
    let Some(body) = node.child_by_field_name("body") else {
        return census;
    };
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        let is_static = has_modifier(member, source, "static") || has_modifier(member, source, "const");
        match member.kind() {
            "property_declaration" => {
                let type_text = member
                    .child_by_field_name("type")
                    .map(|ty| node_text(ty, source))
                    .unwrap_or_default();
                if is_driver_handle_type(&type_text) {
                    census.holds_driver_handle = true;
                }
                if is_static {
                    census.behaviour_members += 1;
                } else {
                    census.data_members += 1;
                }
            }
            "field_declaration" => {
                if let Some(decl) = child_of_kind(member, "variable_declaration") {
                    let (type_node, _) = variable_declaration_parts(decl);
                    if type_node
                        .map(|ty| is_driver_handle_type(&node_text(ty, source)))
                        .unwrap_or(false)
                    {
                        census.holds_driver_handle = true;
                    }
                }
                if is_static {
                    census.behaviour_members += 1;
                } else {
                    census.data_members += 1;
                }
            }
            "constructor_declaration" => {
                if let Some(params) = member.child_by_field_name("parameters") {
                    if node_text(params, source)
                        .split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
                        .any(|token| DRIVER_HANDLE_TYPES.contains(&token))
                    {
                        census.holds_driver_handle = true;
                    }
                }
                census.behaviour_members += 1;
            }
            "method_declaration" | "operator_declaration" | "conversion_operator_declaration"
            | "event_declaration" | "event_field_declaration" | "indexer_declaration" => {
                census.behaviour_members += 1;
            }
            _ => {}
        }
    }
    census
}

fn is_hidden(node: Node<'_>, source: &str, attributes: &[Attribute]) -> bool {
    let explicit_hidden =
        has_modifier(node, source, "private") || has_modifier(node, source, "protected");
    explicit_hidden && attributes.is_empty()
}

fn collect_property(node: Node<'_>, file: &FileContext<'_>, fields: &mut Vec<FieldDefinition>) {
    let source = file.source;
    if has_modifier(node, source, "static") {
        return;
    }
    let Some(name) = node
        .child_by_field_name("name")
        .map(|n| node_text(n, source))
        .filter(|n| !n.is_empty())
    else {
        return;
    };
    let declared_type = node
        .child_by_field_name("type")
        .map(|ty| compact_snippet(&node_text(ty, source), 200))
        .unwrap_or_default();
    let attributes = structural_attributes(&attributes_for_node(node, source), source);
    if is_hidden(node, source, &attributes) {
        return;
    }
    let nullable = is_nullable(&declared_type, &attributes, file);
    fields.push(FieldDefinition {
        name,
        declared_type,
        nullable,
        attributes,
    });
}

fn collect_fields(node: Node<'_>, file: &FileContext<'_>, fields: &mut Vec<FieldDefinition>) {
    let source = file.source;
    if has_modifier(node, source, "static") || has_modifier(node, source, "const") {
        return;
    }
    let Some(decl) = child_of_kind(node, "variable_declaration") else {
        return;
    };
    let attributes = structural_attributes(&attributes_for_node(node, source), source);
    if is_hidden(node, source, &attributes) {
        return;
    }
    let (type_node, declarators) = variable_declaration_parts(decl);
    let declared_type = type_node
        .map(|ty| compact_snippet(&node_text(ty, source), 200))
        .unwrap_or_default();
    let nullable = is_nullable(&declared_type, &attributes, file);
    for declarator in declarators {
        let Some(name) = declarator_name(declarator, source) else {
            continue;
        };
        fields.push(FieldDefinition {
            name,
            declared_type: declared_type.clone(),
            nullable,
            attributes: attributes.clone(),
        });
    }
}

fn collect_record_parameters(
    params: Node<'_>,
    file: &FileContext<'_>,
    fields: &mut Vec<FieldDefinition>,
) {
    let source = file.source;
    let mut cursor = params.walk();
    for param in params.named_children(&mut cursor) {
        if param.kind() != "parameter" {
            continue;
        }
        let Some(name) = param
            .child_by_field_name("name")
            .map(|n| node_text(n, source))
            .filter(|n| !n.is_empty())
        else {
            continue;
        };
        let declared_type = param
            .child_by_field_name("type")
            .map(|ty| compact_snippet(&node_text(ty, source), 200))
            .unwrap_or_default();
        let attributes = structural_attributes(&attributes_for_node(param, source), source);
        let nullable = is_nullable(&declared_type, &attributes, file);
        fields.push(FieldDefinition {
            name,
            declared_type,
            nullable,
            attributes,
        });
    }
}

fn is_nullable(declared_type: &str, attributes: &[Attribute], file: &FileContext<'_>) -> bool {
    let declared = declared_type.trim();
    if declared.ends_with('?') {
        return true;
    }
    let (name, _) = split_generic_text(declared);
    if simple_type_name(&name) == "Nullable" {
        return true;
    }
    if attributes
        .iter()
        .any(|attr| attr.role == AttributeRole::IgnoreIfNull)
    {
        return true;
    }
    let simple = simple_type_name(declared);
    let is_value = !declared.ends_with(']')
        && (is_value_type_name(&simple) || file.value_types.contains(&simple));
    if is_value {
        return false;
    }
    !file.nullable_enabled
}

/// Record `const string` and `static readonly string` members with a literal
/// value so collection hints that name them can be resolved scan-wide.
pub(crate) fn collect_constants(
    node: Node<'_>,
    ctx: &Context,
    file: &FileContext<'_>,
    out: &mut ExtractedFile,
) {
    let source = file.source;
    let is_const = has_modifier(node, source, "const");
    let is_static_readonly =
        has_modifier(node, source, "static") && has_modifier(node, source, "readonly");
    if !is_const && !is_static_readonly {
        return;
    }
    let Some(decl) = child_of_kind(node, "variable_declaration") else {
        return;
    };
    let (type_node, declarators) = variable_declaration_parts(decl);
    let type_text = type_node.map(|ty| node_text(ty, source)).unwrap_or_default();
    if type_text != "string" && type_text != "String" && type_text != "System.String" {
        return;
    }
    let container = ctx.container_path();
    for declarator in declarators {
        let Some(name) = declarator_name(declarator, source) else {
            continue;
        };
        let Some(value) = declarator_initializer(declarator)
            .and_then(|init| extract_string_literal(init, source))
        else {
            continue;
        };
        let qualname = if container.is_empty() {
            name.clone()
        } else {
            format!("{container}.{name}")
        };
        out.constants.push(ConstantInput {
            name,
            qualname,
            value,
        });
    }
}
