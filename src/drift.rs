//! Declared-versus-observed schema comparison.

use crate::indexer::stable_id::drift_signal_id;
use crate::indexer::types::{collection_element_type, element_type_name};
use crate::model::{
    AttributeRole, CodeType, CollectionMapping, DriftKind, DriftSeverity, DriftSignal,
    FieldDefinition, FieldObservation, ObservedSchema,
};
use std::collections::{HashMap, HashSet};

/// Fields the driver writes on its own.
const DRIVER_FIELDS: &[&str] = &["_t"];

/// Compare every mapped type with the sampled schema of its primary collection.
pub fn detect(
    types: &[CodeType],
    mappings: &[CollectionMapping],
    schemas: &[ObservedSchema],
) -> Vec<DriftSignal> {
    let schemas_by_collection: HashMap<&str, &ObservedSchema> = schemas
        .iter()
        .map(|schema| (schema.collection_name.as_str(), schema))
        .collect();
    let known_types: HashSet<&str> = types.iter().map(|t| t.name.as_str()).collect();
    let mut signals = Vec::new();

    for code_type in types {
        let Some(mapping) = mappings
            .iter()
            .find(|m| m.code_type_id == code_type.id && m.is_primary)
        else {
            continue;
        };
        let Some(schema) = schemas_by_collection.get(mapping.collection_name.as_str()) else {
            continue;
        };
        if schema.sample_size == 0 {
            continue;
        }
        compare(code_type, schema, &known_types, &mut signals);
    }
    signals
}

fn compare(
    code_type: &CodeType,
    schema: &ObservedSchema,
    known_types: &HashSet<&str>,
    signals: &mut Vec<DriftSignal>,
) {
    let mut declared = HashSet::new();
    for field in code_type.fields.iter().filter(|f| !f.is_skipped()) {
        let stored = field.stored_name();
        declared.insert(stored.clone());
        let Some(observation) = schema.fields.get(&stored) else {
            signals.push(signal(
                code_type,
                schema,
                &field.name,
                DriftKind::MissingInData,
                DriftSeverity::Warning,
                Some(field.declared_type.clone()),
                None,
                format!(
                    "{}.{} is declared but '{}' never appears in {} sampled documents of {}",
                    code_type.name, field.name, stored, schema.sample_size, schema.collection_name
                ),
            ));
            continue;
        };

        if let Some(observed) = observation.dominant_type() {
            if !type_compatible(field, observed, known_types) {
                signals.push(signal(
                    code_type,
                    schema,
                    &field.name,
                    DriftKind::TypeMismatch,
                    DriftSeverity::Warning,
                    Some(field.declared_type.clone()),
                    Some(observed.to_string()),
                    format!(
                        "{}.{} is declared {} but {} stores '{}' as {}",
                        code_type.name,
                        field.name,
                        field.declared_type,
                        schema.collection_name,
                        stored,
                        observed
                    ),
                ));
            }
        }

        if !field.nullable && !field.is_identity() && !fully_present(observation, schema) {
            signals.push(signal(
                code_type,
                schema,
                &field.name,
                DriftKind::NullabilityMismatch,
                DriftSeverity::Warning,
                Some(field.declared_type.clone()),
                Some(format!(
                    "present in {:.0}% of documents, {} null",
                    observation.presence_ratio * 100.0,
                    observation.types.get("null").copied().unwrap_or(0)
                )),
                format!(
                    "{}.{} is non-nullable but {} has missing or null '{}'",
                    code_type.name, field.name, schema.collection_name, stored
                ),
            ));
        }
    }

    let ignore_extra = code_type.has_role(AttributeRole::IgnoreExtraElements);
    for (path, observation) in &schema.fields {
        if path.contains('.') || path.contains("[]") {
            continue;
        }
        if declared.contains(path) || DRIVER_FIELDS.contains(&path.as_str()) {
            continue;
        }
        let severity = if ignore_extra {
            DriftSeverity::Info
        } else {
            DriftSeverity::Warning
        };
        signals.push(signal(
            code_type,
            schema,
            path,
            DriftKind::UndeclaredField,
            severity,
            None,
            observation.dominant_type().map(str::to_string),
            format!(
                "{} stores '{}' which {} does not declare",
                schema.collection_name, path, code_type.name
            ),
        ));
    }
}

fn fully_present(observation: &FieldObservation, schema: &ObservedSchema) -> bool {
    observation.present >= schema.sample_size
        && observation.types.get("null").copied().unwrap_or(0) == 0
}

/// Observed types a declared C# type may legitimately be stored as. `None`
/// when the declared type says nothing checkable.
fn accepted_types(field: &FieldDefinition, known_types: &HashSet<&str>) -> Option<&'static [&'static str]> {
    let declared = field.declared_type.trim().trim_end_matches('?');
    if declared == "byte[]" || declared == "Byte[]" {
        return Some(&["binary"]);
    }
    if collection_element_type(declared).is_some() {
        return Some(&["array"]);
    }
    let name = element_type_name(declared);
    let accepted: &'static [&'static str] = match name.as_str() {
        "string" | "String" | "char" | "Char" => &["string"],
        "bool" | "Boolean" => &["bool"],
        "int" | "Int32" | "short" | "Int16" | "byte" | "Byte" | "sbyte" | "ushort" => &["int"],
        "long" | "Int64" | "uint" | "UInt32" | "ulong" | "UInt64" => &["int", "long"],
        "double" | "Double" | "float" | "Single" => &["double", "int", "long"],
        "decimal" | "Decimal" | "Decimal128" => &["decimal", "string", "double", "int", "long"],
        "DateTime" | "DateTimeOffset" | "DateOnly" => &["date", "string", "array"],
        "TimeSpan" | "TimeOnly" => &["string", "long", "int"],
        "Guid" => &["uuid", "binary", "string"],
        "ObjectId" => &["objectId", "string"],
        "BsonDocument" => &["object"],
        other if known_types.contains(other) => &["object"],
        other if other.starts_with("Dictionary") || other.starts_with("IDictionary") => {
            &["object", "array"]
        }
        _ => return None,
    };
    Some(accepted)
}

fn type_compatible(field: &FieldDefinition, observed: &str, known_types: &HashSet<&str>) -> bool {
    if field.has_role(AttributeRole::Representation) || field.has_role(AttributeRole::Serializer) {
        return true;
    }
    // string ids are routinely generated as ObjectIds
    if field.is_identity() && observed == "objectId" {
        return true;
    }
    match accepted_types(field, known_types) {
        Some(accepted) => accepted.contains(&observed),
        None => true,
    }
}

#[allow(clippy::too_many_arguments)]
fn signal(
    code_type: &CodeType,
    schema: &ObservedSchema,
    field: &str,
    kind: DriftKind,
    severity: DriftSeverity,
    declared: Option<String>,
    observed: Option<String>,
    message: String,
) -> DriftSignal {
    DriftSignal {
        id: drift_signal_id(&code_type.id, field, kind.as_str()),
        code_type_id: code_type.id.clone(),
        observed_schema_id: schema.id.clone(),
        collection_name: schema.collection_name.clone(),
        field: field.to_string(),
        kind,
        severity,
        declared,
        observed,
        message,
        provenance: code_type.provenance.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Attribute, ProvenanceStamp, ResolutionMethod, SourceSpan,
    };
    use std::collections::BTreeMap;

    fn field(name: &str, declared: &str, nullable: bool) -> FieldDefinition {
        FieldDefinition {
            name: name.into(),
            declared_type: declared.into(),
            nullable,
            attributes: Vec::new(),
        }
    }

    fn observation(types: &[(&str, u64)], present: u64, total: u64) -> FieldObservation {
        FieldObservation {
            types: types.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
            present,
            presence_ratio: present as f64 / total as f64,
        }
    }

    fn fixture(attributes: Vec<Attribute>) -> (CodeType, CollectionMapping, ObservedSchema) {
        let provenance = ProvenanceStamp::new("shop", None).stamp(&SourceSpan {
            file_path: "Models/User.cs".into(),
            symbol: "Shop.User".into(),
            start_line: 1,
            end_line: 9,
        });
        let code_type = CodeType {
            id: "type-user".into(),
            name: "User".into(),
            namespace: "Shop".into(),
            module: "shop".into(),
            fields: vec![
                field("Id", "string", false),
                field("Name", "string", false),
                field("Age", "int", false),
                field("Nickname", "string", true),
            ],
            attributes,
            discriminators: Vec::new(),
            base_type: None,
            provenance: provenance.clone(),
        };
        let mapping = CollectionMapping {
            id: "map-users".into(),
            code_type_id: code_type.id.clone(),
            collection_name: "users".into(),
            method: ResolutionMethod::Inferred,
            confidence: 0.6,
            context: None,
            is_primary: true,
            alternatives: Vec::new(),
            provenance: provenance.clone(),
        };
        let mut fields = BTreeMap::new();
        fields.insert("_id".to_string(), observation(&[("objectId", 4)], 4, 4));
        fields.insert("Name".to_string(), observation(&[("string", 3), ("null", 1)], 4, 4));
        fields.insert("Age".to_string(), observation(&[("string", 4)], 4, 4));
        fields.insert("Legacy".to_string(), observation(&[("bool", 2)], 2, 4));
        let schema = ObservedSchema {
            id: "schema-users".into(),
            collection_mapping_id: Some(mapping.id.clone()),
            collection_name: "users".into(),
            fields,
            required_fields: Vec::new(),
            string_formats: BTreeMap::new(),
            enum_candidates: BTreeMap::new(),
            sample_size: 4,
            pii_redacted: false,
            pii_detections: Vec::new(),
            provenance,
        };
        (code_type, mapping, schema)
    }

    fn kinds(signals: &[DriftSignal], field: &str) -> Vec<DriftKind> {
        signals
            .iter()
            .filter(|s| s.field == field)
            .map(|s| s.kind)
            .collect()
    }

    #[test]
    fn detects_each_drift_kind() {
        let (code_type, mapping, schema) = fixture(Vec::new());
        let signals = detect(&[code_type], &[mapping], &[schema]);
        assert_eq!(kinds(&signals, "Nickname"), vec![DriftKind::MissingInData]);
        assert_eq!(kinds(&signals, "Name"), vec![DriftKind::NullabilityMismatch]);
        assert_eq!(kinds(&signals, "Age"), vec![DriftKind::TypeMismatch]);
        assert_eq!(kinds(&signals, "Legacy"), vec![DriftKind::UndeclaredField]);
        assert!(kinds(&signals, "Id").is_empty());
        let legacy = signals.iter().find(|s| s.field == "Legacy").unwrap();
        assert_eq!(legacy.severity, DriftSeverity::Warning);
    }

    #[test]
    fn ignore_extra_elements_downgrades_undeclared() {
        let attrs = vec![Attribute {
            name: "BsonIgnoreExtraElements".into(),
            role: AttributeRole::IgnoreExtraElements,
            arguments: Vec::new(),
        }];
        let (code_type, mapping, schema) = fixture(attrs);
        let signals = detect(&[code_type], &[mapping], &[schema]);
        let legacy = signals.iter().find(|s| s.field == "Legacy").unwrap();
        assert_eq!(legacy.severity, DriftSeverity::Info);
    }

    #[test]
    fn empty_samples_produce_no_drift() {
        let (code_type, mapping, mut schema) = fixture(Vec::new());
        schema.sample_size = 0;
        schema.fields.clear();
        assert!(detect(&[code_type], &[mapping], &[schema]).is_empty());
    }

    #[test]
    fn ids_are_stable() {
        let (code_type, mapping, schema) = fixture(Vec::new());
        let first = detect(&[code_type.clone()], &[mapping.clone()], &[schema.clone()]);
        let second = detect(&[code_type], &[mapping], &[schema]);
        let a: Vec<_> = first.iter().map(|s| s.id.clone()).collect();
        let b: Vec<_> = second.iter().map(|s| s.id.clone()).collect();
        assert_eq!(a, b);
    }
}
