//! Aggregation pipelines: fluent `Aggregate()` chains and `BsonDocument`
//! pipeline arguments, reduced to ordered stage lists.

use crate::indexer::operations::{binding_for_receiver, HandleBinding};
use crate::indexer::shape::{self, document_pair, document_pairs, json_pairs};
use crate::indexer::syntax::{
    call_arguments, call_target, extract_string_literal, integer_literal, node_text,
    resolve_local_initializer,
};
use crate::model::{AggregationStage, CollectionHint, ExpressionShape};
use crate::util::compact_snippet;
use std::collections::HashMap;
use tree_sitter::Node;

const STAGE_OPERATORS: &[&str] = &[
    "$match",
    "$lookup",
    "$graphLookup",
    "$group",
    "$project",
    "$sort",
    "$limit",
    "$skip",
    "$unwind",
    "$count",
    "$replaceRoot",
    "$replaceWith",
    "$facet",
    "$out",
    "$merge",
    "$sortByCount",
    "$sample",
    "$addFields",
    "$set",
    "$unset",
    "$unionWith",
    "$bucket",
    "$bucketAuto",
    "$densify",
    "$fill",
    "$geoNear",
    "$redact",
    "$setWindowFields",
];

/// Operator reported for an `Aggregate` whose pipeline could not be read.
pub const UNRESOLVED_PIPELINE: &str = "$pipeline";

pub fn is_stage_operator(key: &str) -> bool {
    STAGE_OPERATORS.contains(&key)
}

/// Fluent builder method -> stage operator. `None` for terminal calls.
pub fn fluent_operator(method: &str) -> Option<&'static str> {
    let method = method.strip_suffix("Async").unwrap_or(method);
    let op = match method {
        "Match" => "$match",
        "Lookup" => "$lookup",
        "GraphLookup" => "$graphLookup",
        "Group" => "$group",
        "Project" => "$project",
        "Sort" | "SortBy" | "SortByDescending" | "ThenBy" | "ThenByDescending" => "$sort",
        "Limit" => "$limit",
        "Skip" => "$skip",
        "Unwind" => "$unwind",
        "Count" => "$count",
        "ReplaceRoot" => "$replaceRoot",
        "ReplaceWith" => "$replaceWith",
        "Facet" => "$facet",
        "Out" => "$out",
        "Merge" => "$merge",
        "SortByCount" => "$sortByCount",
        "Sample" => "$sample",
        "AddFields" => "$addFields",
        "Set" => "$set",
        "Unset" => "$unset",
        "UnionWith" => "$unionWith",
        "Bucket" => "$bucket",
        "BucketAuto" => "$bucketAuto",
        "Densify" => "$densify",
        "Fill" => "$fill",
        "GeoNear" => "$geoNear",
        "SetWindowFields" => "$setWindowFields",
        "AppendStage" => UNRESOLVED_PIPELINE,
        _ => return None,
    };
    Some(op)
}

fn stage(operator: &str, shape: ExpressionShape) -> AggregationStage {
    AggregationStage {
        operator: operator.to_string(),
        shape,
        from_collection: None,
        from_type: None,
        local_field: None,
        foreign_field: None,
        output_field: None,
    }
}

fn scalar_shape(node: Node<'_>, source: &str) -> ExpressionShape {
    let text = compact_snippet(&node_text(node, source), shape::MAX_SHAPE_TEXT);
    let summary = match integer_literal(node, source) {
        Some(value) => value.to_string(),
        None => format!("expression {text}"),
    };
    ExpressionShape {
        summary,
        text,
        ..Default::default()
    }
}

/// One stage from a fluent call such as `.Match(x => x.Active)` or
/// `.Lookup("users", "UserId", "_id", "user")`.
pub(crate) fn fluent_stage(
    method: &str,
    args: &[Node<'_>],
    handles: &HashMap<String, HandleBinding>,
    source: &str,
) -> Option<AggregationStage> {
    let operator = fluent_operator(method)?;
    let first = args.first().copied();
    let method = method.strip_suffix("Async").unwrap_or(method);
    let result = match operator {
        UNRESOLVED_PIPELINE => {
            let arg = first?;
            let mut stages = document_stages(arg, handles, source);
            if stages.is_empty() {
                stage(UNRESOLVED_PIPELINE, shape::projection_shape(arg, source))
            } else {
                stages.remove(0)
            }
        }
        "$match" => stage(
            operator,
            first
                .map(|arg| shape::filter_shape(arg, source))
                .unwrap_or_else(ExpressionShape::empty),
        ),
        "$sort" if method != "Sort" => {
            let direction = if method.ends_with("Descending") {
                "desc"
            } else {
                "asc"
            };
            let arg = first?;
            stage(operator, shape::key_selector_shape(arg, source, direction))
        }
        "$sort" => stage(
            operator,
            first
                .map(|arg| shape::sort_shape(arg, source))
                .unwrap_or_else(ExpressionShape::empty),
        ),
        "$limit" | "$skip" | "$sample" | "$count" | "$out" => stage(
            operator,
            first
                .map(|arg| scalar_shape(arg, source))
                .unwrap_or_else(ExpressionShape::empty),
        ),
        "$unwind" | "$sortByCount" => {
            let mut shape = first
                .map(|arg| shape::projection_shape(arg, source))
                .unwrap_or_else(ExpressionShape::empty);
            if let Some(path) = first.and_then(|arg| shape::member_path(arg, source)) {
                if !shape.fields.contains(&path) {
                    shape.fields.push(path.clone());
                }
                shape.summary = format!("{operator} {path}");
            }
            stage(operator, shape)
        }
        "$lookup" | "$graphLookup" | "$unionWith" => join_stage(operator, args, handles, source),
        _ => {
            let mut merged: Option<ExpressionShape> = None;
            for arg in args {
                merged = Some(shape::merge(merged, shape::projection_shape(*arg, source)));
            }
            stage(operator, merged.unwrap_or_else(ExpressionShape::empty))
        }
    };
    Some(result)
}

fn join_stage(
    operator: &str,
    args: &[Node<'_>],
    handles: &HashMap<String, HandleBinding>,
    source: &str,
) -> AggregationStage {
    let text = compact_snippet(
        &args
            .iter()
            .map(|arg| node_text(*arg, source))
            .collect::<Vec<_>>()
            .join(", "),
        shape::MAX_SHAPE_TEXT,
    );
    let mut result = stage(
        operator,
        ExpressionShape {
            summary: operator.to_string(),
            text,
            ..Default::default()
        },
    );
    let Some(first) = args.first().copied() else {
        return result;
    };
    if let Some(name) = extract_string_literal(first, source) {
        result.from_collection = Some(name);
    } else if let Some(binding) = binding_for_receiver(first, handles, source) {
        result.from_type = Some(binding.document_type.clone());
        if let Some(CollectionHint::Literal(name)) = &binding.hint {
            result.from_collection = Some(name.clone());
        }
    } else {
        let pairs = document_pairs(first, source);
        if !pairs.is_empty() {
            apply_join_pairs(&mut result, pairs);
            return finish_join(result);
        }
    }
    if operator == "$lookup" {
        result.local_field = args.get(1).and_then(|arg| shape::member_path(*arg, source));
        result.foreign_field = args.get(2).and_then(|arg| shape::member_path(*arg, source));
        result.output_field = args.get(3).and_then(|arg| shape::member_path(*arg, source));
    }
    finish_join(result)
}

fn apply_join_pairs(result: &mut AggregationStage, pairs: Vec<(String, Option<String>)>) {
    for (key, value) in pairs {
        let Some(value) = value else {
            continue;
        };
        match key.as_str() {
            "from" | "coll" if result.from_collection.is_none() => {
                result.from_collection = Some(value)
            }
            "localField" | "startWith" if result.local_field.is_none() => {
                result.local_field = Some(value.trim_start_matches('$').to_string())
            }
            "foreignField" | "connectToField" if result.foreign_field.is_none() => {
                result.foreign_field = Some(value)
            }
            "as" if result.output_field.is_none() => result.output_field = Some(value),
            _ => {}
        }
    }
}

fn finish_join(mut result: AggregationStage) -> AggregationStage {
    let mut fields = Vec::new();
    for field in [&result.local_field, &result.foreign_field, &result.output_field]
        .into_iter()
        .flatten()
    {
        if !fields.contains(field) {
            fields.push(field.clone());
        }
    }
    let target = result
        .from_collection
        .clone()
        .or_else(|| result.from_type.clone())
        .unwrap_or_else(|| "unknown collection".to_string());
    result.shape.summary = match (&result.local_field, &result.foreign_field) {
        (Some(local), Some(foreign)) => {
            format!("{} {target} on {local} = {foreign}", result.operator)
        }
        _ => format!("{} {target}", result.operator),
    };
    result.shape.fields = fields;
    result.shape.operators = vec![result.operator.clone()];
    result
}

/// Stages of a pipeline argument: `BsonDocument[]`, `PipelineDefinition`
/// built from documents or JSON strings, or a fluent pipeline builder chain.
pub(crate) fn pipeline_stages(
    node: Node<'_>,
    handles: &HashMap<String, HandleBinding>,
    source: &str,
) -> Vec<AggregationStage> {
    let target = resolve_variable(node, source, 0);
    let stages = document_stages(target, handles, source);
    if !stages.is_empty() {
        return stages;
    }
    let mut calls = Vec::new();
    collect_fluent_calls(target, source, &mut calls);
    calls.sort_by_key(|(position, _)| *position);
    calls
        .into_iter()
        .filter_map(|(_, call)| {
            let target = call_target(call, source)?;
            fluent_stage(&target.name, &call_arguments(call), handles, source)
        })
        .collect()
}

fn resolve_variable<'a>(node: Node<'a>, source: &str, depth: usize) -> Node<'a> {
    if node.kind() != "identifier" || depth > 2 {
        return node;
    }
    let name = node_text(node, source);
    match resolve_local_initializer(node, &name, source) {
        Some(init) => resolve_variable(init, source, depth + 1),
        None => node,
    }
}

fn document_stages(
    node: Node<'_>,
    handles: &HashMap<String, HandleBinding>,
    source: &str,
) -> Vec<AggregationStage> {
    let mut out = Vec::new();
    collect_document_stages(node, handles, source, &mut out);
    out
}

fn collect_document_stages(
    node: Node<'_>,
    handles: &HashMap<String, HandleBinding>,
    source: &str,
    out: &mut Vec<AggregationStage>,
) {
    if let Some((key, value)) = document_pair(node, source) {
        if is_stage_operator(&key) {
            out.push(document_stage(&key, value, source));
            return;
        }
    }
    if let Some(json) = extract_string_literal(node, source) {
        if let Some(found) = json_stage(&json, node, source) {
            out.push(found);
        }
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_document_stages(child, handles, source, out);
    }
}

fn document_stage(operator: &str, value: Option<Node<'_>>, source: &str) -> AggregationStage {
    let Some(value) = value else {
        return stage(operator, ExpressionShape::empty());
    };
    if operator == "$lookup" || operator == "$graphLookup" || operator == "$unionWith" {
        let mut result = stage(
            operator,
            ExpressionShape {
                summary: operator.to_string(),
                text: compact_snippet(&node_text(value, source), shape::MAX_SHAPE_TEXT),
                ..Default::default()
            },
        );
        if let Some(name) = extract_string_literal(value, source) {
            result.from_collection = Some(name);
        } else {
            apply_join_pairs(&mut result, document_pairs(value, source));
        }
        return finish_join(result);
    }
    let shape = match operator {
        "$match" => shape::filter_shape(value, source),
        "$limit" | "$skip" | "$count" | "$out" => scalar_shape(value, source),
        "$sort" => shape::sort_shape(value, source),
        _ => shape::projection_shape(value, source),
    };
    stage(operator, shape)
}

/// First stage of a JSON stage string such as `{ $match: { Status: "open" } }`.
fn json_stage(json: &str, node: Node<'_>, source: &str) -> Option<AggregationStage> {
    let pairs = json_pairs(json);
    let (operator, _) = pairs.first()?;
    if !is_stage_operator(operator) {
        return None;
    }
    let operator = operator.clone();
    let text = compact_snippet(&node_text(node, source), shape::MAX_SHAPE_TEXT);
    let rest: Vec<(String, Option<String>)> = pairs.into_iter().skip(1).collect();
    if operator == "$lookup" || operator == "$graphLookup" || operator == "$unionWith" {
        let mut result = stage(
            &operator,
            ExpressionShape {
                summary: operator.clone(),
                text,
                ..Default::default()
            },
        );
        apply_join_pairs(&mut result, rest);
        return Some(finish_join(result));
    }
    let mut fields = Vec::new();
    let mut operators = Vec::new();
    for (key, _) in rest {
        let bucket = if key.starts_with('$') {
            &mut operators
        } else {
            &mut fields
        };
        if !bucket.contains(&key) {
            bucket.push(key);
        }
    }
    let summary = if fields.is_empty() {
        format!("{operator} json")
    } else {
        format!("{operator} json over {}", fields.join(", "))
    };
    Some(stage(
        &operator,
        ExpressionShape {
            summary,
            fields,
            operators,
            text,
        },
    ))
}

fn collect_fluent_calls<'a>(node: Node<'a>, source: &str, out: &mut Vec<(usize, Node<'a>)>) {
    if node.kind() == "invocation_expression" {
        if let Some(function) = node.child_by_field_name("function") {
            if function.kind() == "member_access_expression" {
                if let Some(name_node) = function.child_by_field_name("name") {
                    let (name, _) = crate::indexer::syntax::simple_name_parts(name_node, source);
                    if fluent_operator(&name).is_some() {
                        out.push((name_node.start_byte(), node));
                    }
                }
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_fluent_calls(child, source, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fluent_operator_table() {
        assert_eq!(fluent_operator("Match"), Some("$match"));
        assert_eq!(fluent_operator("SortByDescending"), Some("$sort"));
        assert_eq!(fluent_operator("Lookup"), Some("$lookup"));
        assert_eq!(fluent_operator("ToListAsync"), None);
        assert_eq!(fluent_operator("FirstOrDefault"), None);
    }

    #[test]
    fn stage_operator_recognition() {
        assert!(is_stage_operator("$lookup"));
        assert!(is_stage_operator("$match"));
        assert!(!is_stage_operator("$gt"));
        assert!(!is_stage_operator("from"));
    }
}
