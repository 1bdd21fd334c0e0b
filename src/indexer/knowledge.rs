//! Knowledge base entries: one denormalized, searchable projection per fact.

use crate::indexer::stable_id::kb_entry_id;
use crate::model::{
    CodeType, CollectionMapping, DataRelationship, DriftSeverity, DriftSignal, EntityType,
    KnowledgeBaseEntry, ObservedSchema, Provenance, QueryOperation, ScanFacts,
};
use crate::util::truncate_str_bytes;
use std::collections::HashMap;

const MAX_SEARCHABLE_TEXT: usize = 4096;

struct Names<'a> {
    types: HashMap<&'a str, &'a CodeType>,
    mappings: HashMap<&'a str, &'a CollectionMapping>,
}

impl<'a> Names<'a> {
    fn new(facts: &'a ScanFacts) -> Self {
        Self {
            types: facts.code_types.iter().map(|t| (t.id.as_str(), t)).collect(),
            mappings: facts
                .collection_mappings
                .iter()
                .map(|m| (m.id.as_str(), m))
                .collect(),
        }
    }

    fn type_name(&self, id: &str) -> String {
        self.types
            .get(id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

#[allow(clippy::too_many_arguments)]
fn entry(
    entity_type: EntityType,
    entity_id: &str,
    title: String,
    text: Vec<String>,
    tags: Vec<String>,
    related_ids: Vec<String>,
    relevance: f64,
    provenance: &Provenance,
) -> KnowledgeBaseEntry {
    let mut tags: Vec<String> = tags.into_iter().filter(|tag| !tag.is_empty()).collect();
    tags.sort();
    tags.dedup();
    let mut related_ids: Vec<String> = related_ids
        .into_iter()
        .filter(|id| !id.is_empty() && id != entity_id)
        .collect();
    related_ids.sort();
    related_ids.dedup();
    let searchable = text
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    KnowledgeBaseEntry {
        id: kb_entry_id(entity_type, entity_id),
        entity_type,
        entity_id: entity_id.to_string(),
        title,
        searchable_text: truncate_str_bytes(&searchable, MAX_SEARCHABLE_TEXT),
        tags,
        related_ids,
        relevance: relevance.clamp(0.0, 1.0),
        active: true,
        indexed: true,
        provenance: provenance.clone(),
    }
}

/// Entries for every fact of the scan.
pub fn build_entries(facts: &ScanFacts) -> Vec<KnowledgeBaseEntry> {
    let names = Names::new(facts);
    let mut out = Vec::new();
    for code_type in &facts.code_types {
        out.push(code_type_entry(code_type, facts));
    }
    for mapping in &facts.collection_mappings {
        out.push(mapping_entry(mapping, &names));
    }
    for op in &facts.query_operations {
        out.push(operation_entry(op, &names));
    }
    for rel in &facts.data_relationships {
        out.push(relationship_entry(rel, &names));
    }
    for schema in &facts.observed_schemas {
        out.push(schema_entry(schema));
    }
    for signal in &facts.drift_signals {
        out.push(drift_entry(signal, &names));
    }
    out
}

fn code_type_entry(code_type: &CodeType, facts: &ScanFacts) -> KnowledgeBaseEntry {
    let mut text = vec![
        code_type.qualified_name(),
        code_type.module.clone(),
        code_type.provenance.file_path.clone(),
    ];
    for field in &code_type.fields {
        text.push(format!("{} {}", field.name, field.declared_type));
        let stored = field.stored_name();
        if stored != field.name {
            text.push(stored);
        }
    }
    text.extend(code_type.attributes.iter().map(|a| a.name.clone()));
    text.extend(code_type.discriminators.iter().cloned());
    text.extend(code_type.base_type.iter().cloned());

    let mut related: Vec<String> = facts
        .collection_mappings
        .iter()
        .filter(|m| m.code_type_id == code_type.id)
        .map(|m| m.id.clone())
        .collect();
    related.extend(
        facts
            .data_relationships
            .iter()
            .filter(|r| r.source_type_id == code_type.id || r.target_type_id == code_type.id)
            .map(|r| r.id.clone()),
    );

    entry(
        EntityType::CodeType,
        &code_type.id,
        code_type.qualified_name(),
        text,
        vec![
            EntityType::CodeType.as_str().to_string(),
            code_type.module.clone(),
        ],
        related,
        1.0,
        &code_type.provenance,
    )
}

fn mapping_entry(mapping: &CollectionMapping, names: &Names<'_>) -> KnowledgeBaseEntry {
    let type_name = names.type_name(&mapping.code_type_id);
    let mut text = vec![
        mapping.collection_name.clone(),
        type_name.clone(),
        format!("resolved by {}", mapping.method),
    ];
    text.extend(mapping.context.iter().cloned());
    text.extend(mapping.alternatives.iter().cloned());
    let mut tags = vec![
        EntityType::CollectionMapping.as_str().to_string(),
        mapping.method.as_str().to_string(),
    ];
    if mapping.is_primary {
        tags.push("primary".to_string());
    }
    entry(
        EntityType::CollectionMapping,
        &mapping.id,
        format!("{} ({})", mapping.collection_name, type_name),
        text,
        tags,
        vec![mapping.code_type_id.clone()],
        mapping.confidence,
        &mapping.provenance,
    )
}

fn operation_entry(op: &QueryOperation, names: &Names<'_>) -> KnowledgeBaseEntry {
    let collection = op.collection_name.as_deref().unwrap_or("unresolved");
    let mut text = vec![
        op.kind.as_str().to_string(),
        collection.to_string(),
        op.provenance.symbol.clone(),
        op.provenance.file_path.clone(),
    ];
    text.extend(op.document_type.iter().cloned());
    for shape in [&op.filter, &op.projection, &op.sort, &op.update]
        .into_iter()
        .flatten()
    {
        text.push(shape.summary.clone());
        text.extend(shape.fields.iter().cloned());
    }
    for stage in op.stages.iter().flatten() {
        text.push(stage.operator.clone());
        text.extend(stage.from_collection.iter().cloned());
    }
    let mut tags = vec![
        EntityType::QueryOperation.as_str().to_string(),
        op.kind.as_str().to_string(),
    ];
    if op.transactional {
        tags.push("transactional".to_string());
    }
    let mut related = Vec::new();
    if let Some(mapping) = op
        .collection_mapping_id
        .as_deref()
        .and_then(|id| names.mappings.get(id))
    {
        related.push(mapping.id.clone());
        related.push(mapping.code_type_id.clone());
    }
    let relevance = if op.collection_mapping_id.is_some() {
        1.0
    } else {
        0.5
    };
    entry(
        EntityType::QueryOperation,
        &op.id,
        format!("{} on {} in {}", op.kind, collection, op.provenance.symbol),
        text,
        tags,
        related,
        relevance,
        &op.provenance,
    )
}

fn relationship_entry(rel: &DataRelationship, names: &Names<'_>) -> KnowledgeBaseEntry {
    let source = names.type_name(&rel.source_type_id);
    let target = names.type_name(&rel.target_type_id);
    entry(
        EntityType::DataRelationship,
        &rel.id,
        format!("{} {} {}", source, rel.kind, target),
        vec![
            source.clone(),
            target.clone(),
            rel.field_path.clone(),
            rel.evidence.clone(),
        ],
        vec![
            EntityType::DataRelationship.as_str().to_string(),
            rel.kind.as_str().to_string(),
        ],
        vec![rel.source_type_id.clone(), rel.target_type_id.clone()],
        rel.confidence,
        &rel.provenance,
    )
}

fn schema_entry(schema: &ObservedSchema) -> KnowledgeBaseEntry {
    let mut text = vec![schema.collection_name.clone()];
    text.extend(schema.fields.keys().cloned());
    text.extend(
        schema
            .string_formats
            .iter()
            .map(|(field, format)| format!("{field} {format}")),
    );
    let mut tags = vec![EntityType::ObservedSchema.as_str().to_string()];
    if schema.pii_redacted {
        tags.push("pii".to_string());
    }
    entry(
        EntityType::ObservedSchema,
        &schema.id,
        format!(
            "schema of {} ({} documents)",
            schema.collection_name, schema.sample_size
        ),
        text,
        tags,
        schema.collection_mapping_id.iter().cloned().collect(),
        1.0,
        &schema.provenance,
    )
}

fn drift_entry(signal: &DriftSignal, names: &Names<'_>) -> KnowledgeBaseEntry {
    let type_name = names.type_name(&signal.code_type_id);
    let relevance = match signal.severity {
        DriftSeverity::Warning => 1.0,
        DriftSeverity::Info => 0.5,
    };
    entry(
        EntityType::DriftSignal,
        &signal.id,
        format!("{} {}.{}", signal.kind, type_name, signal.field),
        vec![
            signal.collection_name.clone(),
            signal.field.clone(),
            signal.message.clone(),
        ],
        vec![
            EntityType::DriftSignal.as_str().to_string(),
            signal.kind.as_str().to_string(),
            signal.severity.as_str().to_string(),
        ],
        vec![
            signal.code_type_id.clone(),
            signal.observed_schema_id.clone(),
        ],
        relevance,
        &signal.provenance,
    )
}
