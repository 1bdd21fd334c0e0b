//! Relationship inference over the whole scan: embedded document types,
//! `$lookup` joins, and foreign-key style references corroborated by filters.

use crate::confidence::{
    self, ConfidenceScore, EMBEDDED, LOOKUP, OBJECT_ID_BONUS, REFERS_TO_NAMING_ONLY,
    MAX_FUSED_CONFIDENCE, REFERS_TO_STRONG, REFERS_TO_WEAK_CEILING, REFERS_TO_WEAK_MAX,
    REFERS_TO_WEAK_MIN,
};
use crate::error::{Error, Result};
use crate::indexer::stable_id::relationship_id;
use crate::indexer::types::{element_type_name, is_value_type_name};
use crate::model::{
    Cardinality, CodeType, CollectionMapping, DataRelationship, FieldDefinition, ObservedSchema,
    OperationKind, Provenance, QueryOperation, RelationshipKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};

const FOREIGN_KEY_SUFFIXES: &[&str] = &["Ids", "IDs", "Id", "ID", "Refs", "Ref"];
const MIN_WEAK_STEM: usize = 3;

/// Everything the inferencer reads. `types` and `operations` are required;
/// `None` models a missing input collection and is rejected.
pub struct InferenceInput<'a> {
    pub types: Option<&'a [CodeType]>,
    pub operations: Option<&'a [QueryOperation]>,
    pub mappings: &'a [CollectionMapping],
    pub schemas: &'a [ObservedSchema],
}

impl<'a> InferenceInput<'a> {
    pub fn new(types: &'a [CodeType], operations: &'a [QueryOperation]) -> Self {
        Self {
            types: Some(types),
            operations: Some(operations),
            mappings: &[],
            schemas: &[],
        }
    }

    pub fn with_mappings(mut self, mappings: &'a [CollectionMapping]) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn with_schemas(mut self, schemas: &'a [ObservedSchema]) -> Self {
        self.schemas = schemas;
        self
    }
}

struct Contribution {
    confidence: ConfidenceScore,
    /// Upper bound on the fused edge when only this kind of evidence exists.
    ceiling: ConfidenceScore,
    evidence: String,
    field_path: String,
    cardinality: Cardinality,
    required: bool,
    provenance: Provenance,
}

#[derive(Default)]
struct Accumulator {
    edges: BTreeMap<(String, String, RelationshipKind), Vec<Contribution>>,
}

impl Accumulator {
    fn add(&mut self, source: &CodeType, target: &CodeType, kind: RelationshipKind, c: Contribution) {
        if source.id == target.id {
            return;
        }
        self.edges
            .entry((source.id.clone(), target.id.clone(), kind))
            .or_default()
            .push(c);
    }

    fn finish(self) -> Vec<DataRelationship> {
        let mut out = Vec::with_capacity(self.edges.len());
        for ((source, target, kind), contributions) in self.edges {
            let Some(first) = contributions.first() else {
                continue;
            };
            let scores: Vec<ConfidenceScore> =
                contributions.iter().map(|c| c.confidence).collect();
            let ceiling = contributions
                .iter()
                .map(|c| c.ceiling)
                .fold(0.0, ConfidenceScore::max);
            let mut evidence: Vec<&str> = Vec::new();
            for c in &contributions {
                if !evidence.contains(&c.evidence.as_str()) {
                    evidence.push(c.evidence.as_str());
                }
            }
            out.push(DataRelationship {
                id: relationship_id(&source, &target, kind),
                source_type_id: source,
                target_type_id: target,
                kind,
                confidence: confidence::fuse_capped(&scores).min(ceiling),
                evidence: evidence.join("; "),
                field_path: first.field_path.clone(),
                bidirectional: false,
                cardinality: first.cardinality,
                required: contributions.iter().any(|c| c.required),
                provenance: first.provenance.clone(),
            });
        }
        flag_bidirectional(&mut out);
        out
    }
}

fn flag_bidirectional(relationships: &mut [DataRelationship]) {
    let refers: HashSet<(String, String)> = relationships
        .iter()
        .filter(|rel| rel.kind == RelationshipKind::RefersTo)
        .map(|rel| (rel.source_type_id.clone(), rel.target_type_id.clone()))
        .collect();
    for rel in relationships.iter_mut() {
        if rel.kind == RelationshipKind::RefersTo
            && refers.contains(&(rel.target_type_id.clone(), rel.source_type_id.clone()))
        {
            rel.bidirectional = true;
        }
    }
}

/// Lookup tables shared by the rules.
struct Catalog<'a> {
    types: &'a [CodeType],
    by_id: HashMap<&'a str, &'a CodeType>,
    by_name: HashMap<String, Vec<&'a CodeType>>,
    mapping_by_id: HashMap<&'a str, &'a CollectionMapping>,
    collection_owner: HashMap<&'a str, &'a str>,
    schema_by_collection: HashMap<&'a str, &'a ObservedSchema>,
}

impl<'a> Catalog<'a> {
    fn new(types: &'a [CodeType], mappings: &'a [CollectionMapping], schemas: &'a [ObservedSchema]) -> Self {
        let mut by_name: HashMap<String, Vec<&CodeType>> = HashMap::new();
        for code_type in types {
            by_name
                .entry(code_type.name.to_lowercase())
                .or_default()
                .push(code_type);
        }
        let mut collection_owner = HashMap::new();
        for mapping in mappings.iter().filter(|m| m.is_primary) {
            collection_owner
                .entry(mapping.collection_name.as_str())
                .or_insert(mapping.code_type_id.as_str());
        }
        for mapping in mappings {
            collection_owner
                .entry(mapping.collection_name.as_str())
                .or_insert(mapping.code_type_id.as_str());
        }
        Self {
            types,
            by_id: types.iter().map(|t| (t.id.as_str(), t)).collect(),
            by_name,
            mapping_by_id: mappings.iter().map(|m| (m.id.as_str(), m)).collect(),
            collection_owner,
            schema_by_collection: schemas
                .iter()
                .map(|s| (s.collection_name.as_str(), s))
                .collect(),
        }
    }

    /// Type named `name`; with several candidates, prefer the namespace of `near`.
    fn type_named(&self, name: &str, near: Option<&CodeType>) -> Option<&'a CodeType> {
        let candidates = self.by_name.get(&name.to_lowercase())?;
        if let Some(near) = near {
            if let Some(found) = candidates.iter().find(|c| c.namespace == near.namespace) {
                return Some(found);
            }
        }
        candidates.first().copied()
    }

    fn type_for_collection(&self, collection: &str) -> Option<&'a CodeType> {
        let id = self.collection_owner.get(collection)?;
        self.by_id.get(id).copied()
    }

    fn operation_type(&self, op: &QueryOperation) -> Option<&'a CodeType> {
        if let Some(mapping) = op
            .collection_mapping_id
            .as_deref()
            .and_then(|id| self.mapping_by_id.get(id))
        {
            if let Some(found) = self.by_id.get(mapping.code_type_id.as_str()) {
                return Some(found);
            }
        }
        if let Some(found) = op
            .document_type
            .as_deref()
            .and_then(|name| self.type_named(name, None))
        {
            return Some(found);
        }
        op.collection_name
            .as_deref()
            .and_then(|name| self.type_for_collection(name))
    }

    fn primary_collection(&self, code_type: &CodeType) -> Option<&'a str> {
        self.mapping_by_id
            .values()
            .filter(|m| m.code_type_id == code_type.id)
            .max_by(|a, b| {
                a.is_primary
                    .cmp(&b.is_primary)
                    .then_with(|| b.collection_name.cmp(&a.collection_name))
            })
            .map(|m| m.collection_name.as_str())
    }
}

/// Infer relationships; source and target of every result differ and every
/// confidence lies in `[0, 1]`.
pub fn infer(input: &InferenceInput<'_>) -> Result<Vec<DataRelationship>> {
    let types = input
        .types
        .ok_or_else(|| Error::invalid_argument("relationship inference needs code types"))?;
    let operations = input
        .operations
        .ok_or_else(|| Error::invalid_argument("relationship inference needs query operations"))?;
    let catalog = Catalog::new(types, input.mappings, input.schemas);
    let mut acc = Accumulator::default();

    infer_embedded(&catalog, &mut acc);
    infer_lookups(&catalog, operations, &mut acc);
    infer_references(&catalog, operations, &mut acc);

    let mut relationships = acc.finish();
    for rel in &mut relationships {
        rel.confidence = confidence::clamp(rel.confidence);
    }
    Ok(relationships)
}

fn is_scalar(type_name: &str) -> bool {
    is_value_type_name(type_name)
        || matches!(
            type_name,
            "string" | "String" | "object" | "Object" | "BsonDocument" | "BsonValue" | "dynamic"
        )
}

fn infer_embedded(catalog: &Catalog<'_>, acc: &mut Accumulator) {
    for source in catalog.types {
        for field in source.fields.iter().filter(|f| !f.is_skipped()) {
            let element = element_type_name(&field.declared_type);
            if element.is_empty() || is_scalar(&element) {
                continue;
            }
            let Some(target) = catalog.type_named(&element, Some(source)) else {
                continue;
            };
            let cardinality = if field.is_collection() {
                Cardinality::OneToMany
            } else {
                Cardinality::OneToOne
            };
            acc.add(
                source,
                target,
                RelationshipKind::Embedded,
                Contribution {
                    confidence: EMBEDDED,
                    ceiling: MAX_FUSED_CONFIDENCE,
                    evidence: format!(
                        "field {}.{} is declared as {}",
                        source.name, field.name, field.declared_type
                    ),
                    field_path: field.name.clone(),
                    cardinality,
                    required: !field.nullable,
                    provenance: source.provenance.clone(),
                },
            );
        }
    }
}

fn infer_lookups(catalog: &Catalog<'_>, operations: &[QueryOperation], acc: &mut Accumulator) {
    for op in operations
        .iter()
        .filter(|op| op.kind == OperationKind::Aggregate)
    {
        let Some(source) = catalog.operation_type(op) else {
            continue;
        };
        for stage in op.stages.iter().flatten().filter(|s| s.is_join()) {
            let target = stage
                .from_type
                .as_deref()
                .and_then(|name| catalog.type_named(name, Some(source)))
                .or_else(|| {
                    stage
                        .from_collection
                        .as_deref()
                        .and_then(|name| catalog.type_for_collection(name))
                });
            let Some(target) = target else {
                tracing::debug!(
                    "{}: {} target not mapped to a known type",
                    op.provenance.file_path,
                    stage.operator
                );
                continue;
            };
            let from = stage
                .from_collection
                .clone()
                .unwrap_or_else(|| target.name.clone());
            let mut evidence = format!(
                "{} from '{}' in {} ({})",
                stage.operator, from, op.provenance.symbol, op.provenance.file_path
            );
            if let (Some(local), Some(foreign)) = (&stage.local_field, &stage.foreign_field) {
                evidence.push_str(&format!(" joining {local} = {foreign}"));
            }
            acc.add(
                source,
                target,
                RelationshipKind::Lookup,
                Contribution {
                    confidence: LOOKUP,
                    ceiling: MAX_FUSED_CONFIDENCE,
                    evidence,
                    field_path: stage
                        .local_field
                        .clone()
                        .or_else(|| stage.output_field.clone())
                        .unwrap_or_default(),
                    cardinality: Cardinality::OneToMany,
                    required: false,
                    provenance: op.provenance.clone(),
                },
            );
        }
    }
}

/// `UserId` -> `User`, `TagIds` -> `Tag`, `AuthorRef` -> `Author`.
pub fn foreign_key_stem(field_name: &str) -> Option<&str> {
    let name = field_name.trim_start_matches('_');
    for suffix in FOREIGN_KEY_SUFFIXES {
        if let Some(stem) = name.strip_suffix(suffix) {
            let stem = stem.trim_end_matches('_');
            if !stem.is_empty() {
                return Some(stem);
            }
        }
    }
    None
}

/// Loose match between a key stem and a type name: one ends with the other.
/// Returns the overlap ratio in `(0, 1)`.
fn weak_match(stem: &str, type_name: &str) -> Option<f64> {
    let stem = stem.to_lowercase();
    let name = type_name.to_lowercase();
    if stem == name || stem.len() < MIN_WEAK_STEM || name.len() < MIN_WEAK_STEM {
        return None;
    }
    let (short, long) = if stem.len() < name.len() {
        (&stem, &name)
    } else {
        (&name, &stem)
    };
    if long.ends_with(short.as_str()) || long.starts_with(short.as_str()) {
        Some(short.len() as f64 / long.len() as f64)
    } else {
        None
    }
}

fn filters_by(op: &QueryOperation, field: &FieldDefinition) -> bool {
    let stored = field.stored_name();
    let mentions = |shape: &crate::model::ExpressionShape| {
        shape.mentions_field(&field.name) || shape.mentions_field(&stored)
    };
    if op.filter.as_ref().map(mentions).unwrap_or(false) {
        return true;
    }
    op.stages
        .iter()
        .flatten()
        .filter(|stage| stage.operator == "$match")
        .any(|stage| mentions(&stage.shape))
}

fn infer_references(catalog: &Catalog<'_>, operations: &[QueryOperation], acc: &mut Accumulator) {
    let mut ops_by_type: HashMap<&str, Vec<&QueryOperation>> = HashMap::new();
    for op in operations {
        if let Some(code_type) = catalog.operation_type(op) {
            ops_by_type.entry(code_type.id.as_str()).or_default().push(op);
        }
    }

    for source in catalog.types {
        let source_ops = ops_by_type
            .get(source.id.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let collection = catalog
            .primary_collection(source)
            .unwrap_or(source.name.as_str());
        for field in source.fields.iter().filter(|f| !f.is_skipped() && !f.is_identity()) {
            let Some(stem) = foreign_key_stem(&field.name) else {
                continue;
            };
            let corroborating: Vec<&QueryOperation> = source_ops
                .iter()
                .copied()
                .filter(|op| filters_by(op, field))
                .collect();
            let cardinality = if field.is_collection() {
                Cardinality::ManyToMany
            } else {
                Cardinality::ManyToOne
            };
            let object_id = stores_object_id(catalog, collection, field);

            if let Some(target) = catalog.type_named(stem, Some(source)) {
                let base = REFERS_TO_STRONG + confidence::specificity_bonus(stem);
                if corroborating.is_empty() {
                    let mut evidence = format!(
                        "field {}.{} names {} (naming only, no operation filters by {})",
                        source.name, field.name, target.name, field.name
                    );
                    let mut score = REFERS_TO_NAMING_ONLY;
                    if object_id {
                        score += OBJECT_ID_BONUS;
                        evidence.push_str(&format!("; sampled data stores {} as objectId", field.name));
                    }
                    let mut contribution = reference(score, evidence, field, cardinality, source);
                    contribution.ceiling = REFERS_TO_WEAK_CEILING;
                    acc.add(source, target, RelationshipKind::RefersTo, contribution);
                }
                for op in &corroborating {
                    let mut evidence = format!(
                        "field {}.{} names {} and {} on '{}' filters by {}",
                        source.name, field.name, target.name, op.kind, collection, field.name
                    );
                    if let Some(filter) = &op.filter {
                        evidence.push_str(&format!(" ({})", filter.summary));
                    }
                    let mut score = base;
                    if object_id {
                        score += OBJECT_ID_BONUS;
                        evidence.push_str(&format!("; sampled data stores {} as objectId", field.name));
                    }
                    let mut contribution = reference(score, evidence, field, cardinality, source);
                    contribution.provenance = op.provenance.clone();
                    acc.add(source, target, RelationshipKind::RefersTo, contribution);
                }
                continue;
            }

            if corroborating.is_empty() {
                continue;
            }
            for target in catalog.types {
                if target.id == source.id {
                    continue;
                }
                let Some(overlap) = weak_match(stem, &target.name) else {
                    continue;
                };
                let base =
                    REFERS_TO_WEAK_MIN + (REFERS_TO_WEAK_MAX - REFERS_TO_WEAK_MIN) * overlap;
                for op in &corroborating {
                    let mut evidence = format!(
                        "field {}.{} loosely matches {} and {} on '{}' filters by {}",
                        source.name, field.name, target.name, op.kind, collection, field.name
                    );
                    let mut score = base;
                    if object_id {
                        score = (score + OBJECT_ID_BONUS).min(REFERS_TO_WEAK_CEILING);
                        evidence.push_str(&format!("; sampled data stores {} as objectId", field.name));
                    }
                    let mut contribution = reference(score, evidence, field, cardinality, source);
                    contribution.ceiling = REFERS_TO_WEAK_CEILING;
                    contribution.provenance = op.provenance.clone();
                    acc.add(source, target, RelationshipKind::RefersTo, contribution);
                }
            }
        }
    }
}

fn reference(
    confidence: ConfidenceScore,
    evidence: String,
    field: &FieldDefinition,
    cardinality: Cardinality,
    source: &CodeType,
) -> Contribution {
    Contribution {
        confidence: confidence::clamp(confidence),
        ceiling: MAX_FUSED_CONFIDENCE,
        evidence,
        field_path: field.name.clone(),
        cardinality,
        required: !field.nullable,
        provenance: source.provenance.clone(),
    }
}

fn stores_object_id(catalog: &Catalog<'_>, collection: &str, field: &FieldDefinition) -> bool {
    let Some(schema) = catalog.schema_by_collection.get(collection) else {
        return false;
    };
    let stored = field.stored_name();
    [field.name.clone(), stored.clone(), format!("{stored}[]")]
        .iter()
        .filter_map(|path| schema.fields.get(path))
        .any(|observation| observation.dominant_type() == Some("objectId"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_stems() {
        assert_eq!(foreign_key_stem("UserId"), Some("User"));
        assert_eq!(foreign_key_stem("TagIds"), Some("Tag"));
        assert_eq!(foreign_key_stem("AuthorRef"), Some("Author"));
        assert_eq!(foreign_key_stem("customer_id"), None);
        assert_eq!(foreign_key_stem("Customer_Id"), Some("Customer"));
        assert_eq!(foreign_key_stem("Id"), None);
        assert_eq!(foreign_key_stem("Name"), None);
    }

    #[test]
    fn weak_matches_need_overlap() {
        assert!(weak_match("AssignedUser", "User").is_some());
        assert!(weak_match("Cust", "Customer").is_some());
        assert!(weak_match("User", "User").is_none());
        assert!(weak_match("Owner", "User").is_none());
        let ratio = weak_match("AssignedUser", "User").unwrap();
        assert!(ratio > 0.0 && ratio < 1.0);
    }
}
