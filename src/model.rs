use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const EXTRACTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where a fact came from. Every fact carries one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub repository: String,
    pub file_path: String,
    pub symbol: String,
    pub start_line: i64,
    pub end_line: i64,
    pub commit: Option<String>,
    pub extracted_at: DateTime<Utc>,
    pub extractor_version: String,
}

/// Location of a fact inside one file, before the run-level stamp is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file_path: String,
    pub symbol: String,
    pub start_line: i64,
    pub end_line: i64,
}

/// Run-level half of a [`Provenance`]: repository, commit and timestamp.
#[derive(Debug, Clone)]
pub struct ProvenanceStamp {
    pub repository: String,
    pub commit: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

impl ProvenanceStamp {
    pub fn new(repository: impl Into<String>, commit: Option<String>) -> Self {
        Self {
            repository: repository.into(),
            commit,
            extracted_at: Utc::now(),
        }
    }

    pub fn stamp(&self, span: &SourceSpan) -> Provenance {
        Provenance {
            repository: self.repository.clone(),
            file_path: span.file_path.clone(),
            symbol: span.symbol.clone(),
            start_line: span.start_line,
            end_line: span.end_line,
            commit: self.commit.clone(),
            extracted_at: self.extracted_at,
            extractor_version: EXTRACTOR_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeRole {
    Identity,
    Rename,
    Skip,
    Representation,
    Required,
    IgnoreIfNull,
    IgnoreIfDefault,
    DefaultValue,
    DateTimeOptions,
    Serializer,
    Discriminator,
    KnownTypes,
    IgnoreExtraElements,
    NoId,
    CollectionName,
}

/// A recognized structural attribute with its arguments (string literals unquoted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub role: AttributeRole,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
}

impl FieldDefinition {
    pub fn has_role(&self, role: AttributeRole) -> bool {
        self.attributes.iter().any(|attr| attr.role == role)
    }

    pub fn is_identity(&self) -> bool {
        self.has_role(AttributeRole::Identity) || self.name == "Id" || self.name == "_id"
    }

    pub fn is_skipped(&self) -> bool {
        self.has_role(AttributeRole::Skip)
    }

    /// Element name the driver writes for this member.
    pub fn stored_name(&self) -> String {
        if let Some(renamed) = self
            .attributes
            .iter()
            .find(|attr| attr.role == AttributeRole::Rename)
            .and_then(|attr| attr.arguments.first())
        {
            return renamed.clone();
        }
        if self.is_identity() {
            return "_id".to_string();
        }
        self.name.clone()
    }

    /// Whether the declared type is a collection (`List<T>`, `T[]`, ...).
    pub fn is_collection(&self) -> bool {
        crate::indexer::types::collection_element_type(&self.declared_type).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeType {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub module: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discriminators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,
    pub provenance: Provenance,
}

impl CodeType {
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_role(&self, role: AttributeRole) -> bool {
        self.attributes.iter().any(|attr| attr.role == role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Literal,
    Constant,
    Config,
    Inferred,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::Literal => "literal",
            ResolutionMethod::Constant => "constant",
            ResolutionMethod::Config => "config",
            ResolutionMethod::Inferred => "inferred",
        }
    }
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection-name hint found at a call site, as written in source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "form", content = "value", rename_all = "snake_case")]
pub enum CollectionHint {
    /// A string literal (or `nameof(X)`), verbatim.
    Literal(String),
    /// An identifier or member access that may name a constant.
    Identifier(String),
    /// A configuration key such as `Mongo:Collections:Users`.
    ConfigKey(String),
}

impl fmt::Display for CollectionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionHint::Literal(value) => write!(f, "\"{value}\""),
            CollectionHint::Identifier(value) => f.write_str(value),
            CollectionHint::ConfigKey(value) => write!(f, "config[\"{value}\"]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub id: String,
    pub code_type_id: String,
    pub collection_name: String,
    pub method: ResolutionMethod,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Find,
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    Aggregate,
    Count,
    Distinct,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    BulkWrite,
}

impl OperationKind {
    /// Closed call-site classifier. `Async` suffixes are ignored; anything
    /// outside the table is unclassified.
    pub fn classify(member: &str) -> Option<OperationKind> {
        let name = member.strip_suffix("Async").unwrap_or(member);
        let kind = match name {
            "Find" | "FindSync" | "AsQueryable" => OperationKind::Find,
            "InsertOne" => OperationKind::InsertOne,
            "InsertMany" => OperationKind::InsertMany,
            "UpdateOne" => OperationKind::UpdateOne,
            "UpdateMany" => OperationKind::UpdateMany,
            "ReplaceOne" => OperationKind::ReplaceOne,
            "DeleteOne" => OperationKind::DeleteOne,
            "DeleteMany" => OperationKind::DeleteMany,
            "Aggregate" => OperationKind::Aggregate,
            "CountDocuments" | "EstimatedDocumentCount" | "Count" => OperationKind::Count,
            "Distinct" => OperationKind::Distinct,
            "FindOneAndUpdate" => OperationKind::FindOneAndUpdate,
            "FindOneAndReplace" => OperationKind::FindOneAndReplace,
            "FindOneAndDelete" => OperationKind::FindOneAndDelete,
            "BulkWrite" => OperationKind::BulkWrite,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Find => "Find",
            OperationKind::InsertOne => "InsertOne",
            OperationKind::InsertMany => "InsertMany",
            OperationKind::UpdateOne => "UpdateOne",
            OperationKind::UpdateMany => "UpdateMany",
            OperationKind::ReplaceOne => "ReplaceOne",
            OperationKind::DeleteOne => "DeleteOne",
            OperationKind::DeleteMany => "DeleteMany",
            OperationKind::Aggregate => "Aggregate",
            OperationKind::Count => "Count",
            OperationKind::Distinct => "Distinct",
            OperationKind::FindOneAndUpdate => "FindOneAndUpdate",
            OperationKind::FindOneAndReplace => "FindOneAndReplace",
            OperationKind::FindOneAndDelete => "FindOneAndDelete",
            OperationKind::BulkWrite => "BulkWrite",
        }
    }

    /// Operations whose first argument is a filter.
    pub fn takes_filter(&self) -> bool {
        matches!(
            self,
            OperationKind::Find
                | OperationKind::UpdateOne
                | OperationKind::UpdateMany
                | OperationKind::ReplaceOne
                | OperationKind::DeleteOne
                | OperationKind::DeleteMany
                | OperationKind::Count
                | OperationKind::FindOneAndUpdate
                | OperationKind::FindOneAndReplace
                | OperationKind::FindOneAndDelete
        )
    }

    pub fn is_update(&self) -> bool {
        matches!(
            self,
            OperationKind::UpdateOne | OperationKind::UpdateMany | OperationKind::FindOneAndUpdate
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Syntactic shape of a filter/projection/sort/update argument. Values are
/// never evaluated; only the fields and operators the expression mentions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionShape {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl ExpressionShape {
    pub fn empty() -> Self {
        Self {
            summary: "empty".to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.operators.is_empty() && self.summary == "empty"
    }

    pub fn mentions_field(&self, field: &str) -> bool {
        self.fields
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(field))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationStage {
    pub operator: String,
    pub shape: ExpressionShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_collection: Option<String>,
    /// Document type of the joined collection when it is named through a typed handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_field: Option<String>,
}

impl AggregationStage {
    pub fn is_join(&self) -> bool {
        matches!(self.operator.as_str(), "$lookup" | "$graphLookup")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOperation {
    pub id: String,
    pub kind: OperationKind,
    /// Filled at the join point; `None` when no mapping could be attached.
    pub collection_mapping_id: Option<String>,
    pub collection_name: Option<String>,
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_hint: Option<CollectionHint>,
    pub filter: Option<ExpressionShape>,
    pub projection: Option<ExpressionShape>,
    pub sort: Option<ExpressionShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<ExpressionShape>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub stages: Option<Vec<AggregationStage>>,
    pub transactional: bool,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    RefersTo,
    Lookup,
    Embedded,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::RefersTo => "REFERS_TO",
            RelationshipKind::Lookup => "LOOKUP",
            RelationshipKind::Embedded => "EMBEDDED",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRelationship {
    pub id: String,
    pub source_type_id: String,
    pub target_type_id: String,
    pub kind: RelationshipKind,
    pub confidence: f64,
    pub evidence: String,
    pub field_path: String,
    pub bidirectional: bool,
    pub cardinality: Cardinality,
    pub required: bool,
    pub provenance: Provenance,
}

/// Per-field statistics of a sampled collection. Never holds values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldObservation {
    pub types: BTreeMap<String, u64>,
    pub present: u64,
    pub presence_ratio: f64,
}

impl FieldObservation {
    /// The most frequently observed non-null type.
    pub fn dominant_type(&self) -> Option<&str> {
        self.types
            .iter()
            .filter(|(name, _)| name.as_str() != "null")
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiDetection {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedSchema {
    pub id: String,
    pub collection_mapping_id: Option<String>,
    pub collection_name: String,
    pub fields: BTreeMap<String, FieldObservation>,
    pub required_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_formats: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enum_candidates: BTreeMap<String, Vec<String>>,
    pub sample_size: u64,
    pub pii_redacted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pii_detections: Vec<PiiDetection>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    MissingInData,
    UndeclaredField,
    TypeMismatch,
    NullabilityMismatch,
}

impl DriftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftKind::MissingInData => "missing_in_data",
            DriftKind::UndeclaredField => "undeclared_field",
            DriftKind::TypeMismatch => "type_mismatch",
            DriftKind::NullabilityMismatch => "nullability_mismatch",
        }
    }
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Info,
    Warning,
}

impl DriftSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::Info => "info",
            DriftSeverity::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSignal {
    pub id: String,
    pub code_type_id: String,
    pub observed_schema_id: String,
    pub collection_name: String,
    pub field: String,
    pub kind: DriftKind,
    pub severity: DriftSeverity,
    pub declared: Option<String>,
    pub observed: Option<String>,
    pub message: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    CodeType,
    CollectionMapping,
    QueryOperation,
    DataRelationship,
    ObservedSchema,
    DriftSignal,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::CodeType => "code_type",
            EntityType::CollectionMapping => "collection_mapping",
            EntityType::QueryOperation => "query_operation",
            EntityType::DataRelationship => "data_relationship",
            EntityType::ObservedSchema => "observed_schema",
            EntityType::DriftSignal => "drift_signal",
        }
    }

    pub fn parse(raw: &str) -> Option<EntityType> {
        let entity = match raw.trim().to_ascii_lowercase().as_str() {
            "code_type" | "type" => EntityType::CodeType,
            "collection_mapping" | "mapping" => EntityType::CollectionMapping,
            "query_operation" | "operation" => EntityType::QueryOperation,
            "data_relationship" | "relationship" => EntityType::DataRelationship,
            "observed_schema" | "schema" => EntityType::ObservedSchema,
            "drift_signal" | "drift" => EntityType::DriftSignal,
            _ => return None,
        };
        Some(entity)
    }
}

/// Denormalized, search-oriented projection of one fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseEntry {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub searchable_text: String,
    pub tags: Vec<String>,
    pub related_ids: Vec<String>,
    pub relevance: f64,
    pub active: bool,
    pub indexed: bool,
    pub provenance: Provenance,
}

/// Everything one scan produced, before it is written.
#[derive(Debug, Default, Clone)]
pub struct ScanFacts {
    pub code_types: Vec<CodeType>,
    pub collection_mappings: Vec<CollectionMapping>,
    pub query_operations: Vec<QueryOperation>,
    pub data_relationships: Vec<DataRelationship>,
    pub observed_schemas: Vec<ObservedSchema>,
    pub drift_signals: Vec<DriftSignal>,
    pub kb_entries: Vec<KnowledgeBaseEntry>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FactCounts {
    pub code_types: usize,
    pub collection_mappings: usize,
    pub query_operations: usize,
    pub data_relationships: usize,
    pub observed_schemas: usize,
    pub drift_signals: usize,
    pub kb_entries: usize,
}

impl From<&ScanFacts> for FactCounts {
    fn from(facts: &ScanFacts) -> Self {
        Self {
            code_types: facts.code_types.len(),
            collection_mappings: facts.collection_mappings.len(),
            query_operations: facts.query_operations.len(),
            data_relationships: facts.data_relationships.len(),
            observed_schemas: facts.observed_schemas.len(),
            drift_signals: facts.drift_signals.len(),
            kb_entries: facts.kb_entries.len(),
        }
    }
}

/// Completion report of a scan run. Produced even when files or writes fail.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub repository: String,
    pub commit: Option<String>,
    pub files_scanned: usize,
    pub files_extracted: usize,
    pub files_skipped: usize,
    pub files_cancelled: usize,
    pub extracted: FactCounts,
    pub sample_failures: usize,
    pub failed_writes: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct StoreOverview {
    pub db_path: String,
    pub counts: FactCounts,
    pub last_scan: Option<ScanSummary>,
}
