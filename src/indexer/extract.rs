use crate::model::{
    AggregationStage, Attribute, CollectionHint, ExpressionShape, FieldDefinition, OperationKind,
    SourceSpan,
};

#[derive(Debug, Clone)]
pub struct TypeInput {
    pub name: String,
    /// Enclosing namespace plus any outer type names.
    pub namespace: String,
    pub fields: Vec<FieldDefinition>,
    pub attributes: Vec<Attribute>,
    pub discriminators: Vec<String>,
    pub base_type: Option<String>,
    pub span: SourceSpan,
}

impl TypeInput {
    pub fn qualname(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// A place in source that names the collection for a document type:
/// `GetCollection<User>("users")` or `[CollectionName("users")]`.
#[derive(Debug, Clone)]
pub struct HintSite {
    pub document_type: String,
    pub hint: CollectionHint,
    pub context: String,
    pub span: SourceSpan,
}

/// `const string` / `static readonly string` with a literal value.
#[derive(Debug, Clone)]
pub struct ConstantInput {
    pub name: String,
    pub qualname: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct OperationInput {
    pub kind: OperationKind,
    pub document_type: Option<String>,
    pub hint: Option<CollectionHint>,
    pub filter: Option<ExpressionShape>,
    pub projection: Option<ExpressionShape>,
    pub sort: Option<ExpressionShape>,
    pub update: Option<ExpressionShape>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub stages: Option<Vec<AggregationStage>>,
    pub transactional: bool,
    pub span: SourceSpan,
    /// Position among operations of the same kind in the same member.
    pub ordinal: usize,
}

impl OperationInput {
    pub fn new(kind: OperationKind, span: SourceSpan) -> Self {
        Self {
            kind,
            document_type: None,
            hint: None,
            filter: None,
            projection: None,
            sort: None,
            update: None,
            limit: None,
            skip: None,
            stages: None,
            transactional: false,
            span,
            ordinal: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExtractedFile {
    pub types: Vec<TypeInput>,
    pub operations: Vec<OperationInput>,
    pub hint_sites: Vec<HintSite>,
    pub constants: Vec<ConstantInput>,
    /// The tree contained error nodes; extraction was best-effort.
    pub partial: bool,
}
