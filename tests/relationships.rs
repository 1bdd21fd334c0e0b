use colldex::error::Error;
use colldex::indexer::relationships::{InferenceInput, infer};
use colldex::indexer::resolver::{CollectionResolver, ConstantTable};
use colldex::indexer::stable_id::{code_type_id, query_operation_id};
use colldex::model::{
    AggregationStage, Cardinality, CodeType, CollectionMapping, ExpressionShape, FieldDefinition,
    FieldObservation, ObservedSchema, OperationKind, ProvenanceStamp, QueryOperation,
    RelationshipKind, SourceSpan,
};
use std::collections::BTreeMap;

fn stamp() -> ProvenanceStamp {
    ProvenanceStamp::new("shop", None)
}

fn span(symbol: &str) -> SourceSpan {
    SourceSpan {
        file_path: "src/Shop.cs".to_string(),
        symbol: symbol.to_string(),
        start_line: 1,
        end_line: 10,
    }
}

fn field(name: &str, declared_type: &str, nullable: bool) -> FieldDefinition {
    FieldDefinition {
        name: name.to_string(),
        declared_type: declared_type.to_string(),
        nullable,
        attributes: Vec::new(),
    }
}

fn code_type(name: &str, fields: Vec<FieldDefinition>) -> CodeType {
    let qualname = format!("Shop.{name}");
    CodeType {
        id: code_type_id("shop", "src/Shop.cs", &qualname),
        name: name.to_string(),
        namespace: "Shop".to_string(),
        module: "Shop".to_string(),
        fields,
        attributes: Vec::new(),
        discriminators: Vec::new(),
        base_type: None,
        provenance: stamp().stamp(&span(&qualname)),
    }
}

fn operation(kind: OperationKind, document_type: &str, symbol: &str) -> QueryOperation {
    QueryOperation {
        id: query_operation_id("shop", "src/Shop.cs", symbol, kind, 0),
        kind,
        collection_mapping_id: None,
        collection_name: None,
        document_type: Some(document_type.to_string()),
        collection_hint: None,
        filter: None,
        projection: None,
        sort: None,
        update: None,
        limit: None,
        skip: None,
        stages: None,
        transactional: false,
        provenance: stamp().stamp(&span(symbol)),
    }
}

fn shop_types() -> Vec<CodeType> {
    vec![
        code_type(
            "User",
            vec![field("Id", "string", false), field("Name", "string", false)],
        ),
        code_type(
            "Order",
            vec![
                field("Id", "string", false),
                field("UserId", "string", false),
                field("Customer", "Customer", true),
                field("Lines", "List<OrderLine>", false),
                field("Total", "decimal", false),
            ],
        ),
        code_type("Customer", vec![field("Email", "string", false)]),
        code_type("OrderLine", vec![field("Sku", "string", false)]),
    ]
}

fn mappings(types: &[CodeType]) -> Vec<CollectionMapping> {
    CollectionResolver::new(ConstantTable::new(), stamp()).reconcile(types, &[])
}

fn filtering(symbol: &str, field: &str, summary: &str) -> QueryOperation {
    let mut op = operation(OperationKind::Find, "Order", symbol);
    op.filter = Some(ExpressionShape {
        summary: summary.to_string(),
        fields: vec![field.to_string()],
        operators: vec!["==".to_string()],
        text: String::new(),
    });
    op
}

fn object_id_schema(collection: &str, field: &str) -> ObservedSchema {
    let observation = FieldObservation {
        types: BTreeMap::from([("objectId".to_string(), 5)]),
        present: 5,
        presence_ratio: 1.0,
    };
    ObservedSchema {
        id: format!("schema_{collection}"),
        collection_mapping_id: None,
        collection_name: collection.to_string(),
        fields: BTreeMap::from([(field.to_string(), observation)]),
        required_fields: vec![field.to_string()],
        string_formats: BTreeMap::new(),
        enum_candidates: BTreeMap::new(),
        sample_size: 5,
        pii_redacted: false,
        pii_detections: Vec::new(),
        provenance: stamp().stamp(&span(collection)),
    }
}

fn refers_to(result: &[colldex::model::DataRelationship]) -> &colldex::model::DataRelationship {
    result
        .iter()
        .find(|r| r.kind == RelationshipKind::RefersTo)
        .unwrap()
}

fn find<'a>(types: &'a [CodeType], name: &str) -> &'a CodeType {
    types.iter().find(|t| t.name == name).unwrap()
}

#[test]
fn embedded_fields_produce_high_confidence_edges() {
    let types = shop_types();
    let result = infer(&InferenceInput::new(&types, &[])).unwrap();
    let order = find(&types, "Order");
    let customer = find(&types, "Customer");
    let line = find(&types, "OrderLine");

    let embedded = result
        .iter()
        .find(|r| r.kind == RelationshipKind::Embedded && r.target_type_id == customer.id)
        .unwrap();
    assert_eq!(embedded.source_type_id, order.id);
    assert!(embedded.confidence > 0.9);
    assert!(embedded.evidence.contains("Customer"));
    assert_eq!(embedded.cardinality, Cardinality::OneToOne);
    assert!(!embedded.required);

    let lines = result
        .iter()
        .find(|r| r.kind == RelationshipKind::Embedded && r.target_type_id == line.id)
        .unwrap();
    assert_eq!(lines.cardinality, Cardinality::OneToMany);
    assert_eq!(lines.field_path, "Lines");
    assert!(lines.required);
}

#[test]
fn filtered_foreign_key_is_a_strong_reference() {
    let types = shop_types();
    let mappings = mappings(&types);
    let mut op = operation(OperationKind::Find, "Order", "Shop.OrderRepository.ForUser");
    op.filter = Some(ExpressionShape {
        summary: "lambda comparing field UserId".to_string(),
        fields: vec!["UserId".to_string()],
        operators: vec!["==".to_string()],
        text: "o => o.UserId == userId".to_string(),
    });
    let ops = vec![op];
    let result = infer(&InferenceInput::new(&types, &ops).with_mappings(&mappings)).unwrap();

    let order = find(&types, "Order");
    let user = find(&types, "User");
    let refers = result
        .iter()
        .find(|r| r.kind == RelationshipKind::RefersTo)
        .unwrap();
    assert_eq!(refers.source_type_id, order.id);
    assert_eq!(refers.target_type_id, user.id);
    assert!(refers.confidence > 0.7, "{}", refers.confidence);
    assert!(refers.evidence.contains("UserId"));
    assert!(refers.evidence.contains("'orders'"));
    assert_eq!(refers.cardinality, Cardinality::ManyToOne);
    assert_eq!(refers.provenance.symbol, "Shop.OrderRepository.ForUser");
}

#[test]
fn unfiltered_foreign_key_is_naming_only() {
    let types = shop_types();
    let result = infer(&InferenceInput::new(&types, &[])).unwrap();
    let refers = result
        .iter()
        .find(|r| r.kind == RelationshipKind::RefersTo)
        .unwrap();
    assert_eq!(refers.confidence, 0.6);
    assert!(refers.evidence.contains("naming only"));
}

#[test]
fn lookup_stage_joins_collections() {
    let types = shop_types();
    let mappings = mappings(&types);
    let mut op = operation(OperationKind::Aggregate, "Order", "Shop.Reports.OrdersWithUsers");
    op.stages = Some(vec![AggregationStage {
        operator: "$lookup".to_string(),
        shape: ExpressionShape {
            summary: "$lookup users on UserId = _id".to_string(),
            fields: vec!["UserId".to_string(), "_id".to_string(), "user".to_string()],
            operators: vec!["$lookup".to_string()],
            text: String::new(),
        },
        from_collection: Some("users".to_string()),
        from_type: None,
        local_field: Some("UserId".to_string()),
        foreign_field: Some("_id".to_string()),
        output_field: Some("user".to_string()),
    }]);
    let ops = vec![op];
    let result = infer(&InferenceInput::new(&types, &ops).with_mappings(&mappings)).unwrap();

    let user = find(&types, "User");
    let lookup = result
        .iter()
        .find(|r| r.kind == RelationshipKind::Lookup)
        .unwrap();
    assert_eq!(lookup.source_type_id, find(&types, "Order").id);
    assert_eq!(lookup.target_type_id, user.id);
    assert!(lookup.confidence > 0.8);
    assert!(lookup.evidence.contains("$lookup"));
    assert!(lookup.evidence.contains("'users'"));
    assert_eq!(lookup.field_path, "UserId");
}

#[test]
fn every_edge_links_distinct_types_with_bounded_confidence() {
    let mut types = shop_types();
    types.push(code_type(
        "Node",
        vec![field("ParentId", "string", true), field("Parent", "Node", true)],
    ));
    let result = infer(&InferenceInput::new(&types, &[])).unwrap();
    assert!(!result.is_empty());
    for rel in &result {
        assert_ne!(rel.source_type_id, rel.target_type_id);
        assert!((0.0..=1.0).contains(&rel.confidence));
        assert!(!rel.evidence.is_empty());
    }
}

#[test]
fn empty_inputs_yield_no_relationships() {
    let result = infer(&InferenceInput::new(&[], &[])).unwrap();
    assert!(result.is_empty());
}

#[test]
fn missing_inputs_are_rejected() {
    let types = shop_types();
    let mut input = InferenceInput::new(&types, &[]);
    input.operations = None;
    assert!(matches!(infer(&input), Err(Error::InvalidArgument(_))));

    let mut input = InferenceInput::new(&[], &[]);
    input.types = None;
    assert!(matches!(infer(&input), Err(Error::InvalidArgument(_))));
}

fn assignment_types() -> Vec<CodeType> {
    vec![
        code_type("User", vec![field("Id", "string", false)]),
        code_type(
            "Order",
            vec![
                field("Id", "string", false),
                field("AssignedUserId", "string", false),
            ],
        ),
    ]
}

#[test]
fn loose_name_match_stays_below_strong_band() {
    let types = assignment_types();
    let mappings = mappings(&types);
    let ops: Vec<QueryOperation> = ["Mine", "Open", "Late"]
        .iter()
        .map(|name| {
            filtering(
                &format!("Shop.OrderRepository.{name}"),
                "AssignedUserId",
                &format!("{name} by assignee"),
            )
        })
        .collect();

    let one = infer(&InferenceInput::new(&types, &ops[..1]).with_mappings(&mappings)).unwrap();
    let single = refers_to(&one);
    assert_eq!(single.target_type_id, find(&types, "User").id);
    assert!(single.confidence < 0.7, "{}", single.confidence);

    let many = infer(&InferenceInput::new(&types, &ops).with_mappings(&mappings)).unwrap();
    let fused = refers_to(&many);
    assert!(fused.confidence < 0.7, "{}", fused.confidence);
    assert!(fused.confidence >= single.confidence);

    // Same operations in reverse order fuse to the same score.
    let reversed: Vec<QueryOperation> = ops.iter().rev().cloned().collect();
    let again = infer(&InferenceInput::new(&types, &reversed).with_mappings(&mappings)).unwrap();
    assert_eq!(refers_to(&again).confidence, fused.confidence);

    let schemas = vec![object_id_schema("orders", "AssignedUserId")];
    let sampled = infer(
        &InferenceInput::new(&types, &ops)
            .with_mappings(&mappings)
            .with_schemas(&schemas),
    )
    .unwrap();
    let sampled = refers_to(&sampled);
    assert!(sampled.confidence < 0.7, "{}", sampled.confidence);
    assert!(sampled.evidence.contains("objectId"));
}

#[test]
fn repeated_evidence_is_merged_into_one_edge() {
    let types = shop_types();
    let mappings = mappings(&types);
    let ops = vec![
        filtering("Shop.OrderRepository.ForUser", "UserId", "lambda comparing field UserId"),
        filtering("Shop.OrderRepository.Pending", "UserId", "builder Eq on UserId"),
    ];

    let one = infer(&InferenceInput::new(&types, &ops[..1]).with_mappings(&mappings)).unwrap();
    let both = infer(&InferenceInput::new(&types, &ops).with_mappings(&mappings)).unwrap();
    let edges: Vec<_> = both
        .iter()
        .filter(|r| r.kind == RelationshipKind::RefersTo)
        .collect();
    assert_eq!(edges.len(), 1);
    let merged = edges[0];
    assert!(merged.evidence.contains("lambda comparing field UserId"));
    assert!(merged.evidence.contains("builder Eq on UserId"));
    assert!(merged.evidence.contains("; "));
    assert!(merged.confidence >= refers_to(&one).confidence);
    assert!(merged.confidence <= 0.99);
}

#[test]
fn object_id_storage_raises_reference_confidence() {
    let types = shop_types();
    let mappings = mappings(&types);
    let ops = vec![filtering(
        "Shop.OrderRepository.ForUser",
        "UserId",
        "lambda comparing field UserId",
    )];
    let plain = infer(&InferenceInput::new(&types, &ops).with_mappings(&mappings)).unwrap();
    let schemas = vec![object_id_schema("orders", "UserId")];
    let sampled = infer(
        &InferenceInput::new(&types, &ops)
            .with_mappings(&mappings)
            .with_schemas(&schemas),
    )
    .unwrap();

    let plain = refers_to(&plain);
    let sampled = refers_to(&sampled);
    assert!((sampled.confidence - plain.confidence - 0.05).abs() < 1e-9);
    assert!(sampled.evidence.contains("objectId"));
    assert!(!plain.evidence.contains("objectId"));
}

#[test]
fn mutual_references_are_bidirectional() {
    let types = vec![
        code_type(
            "User",
            vec![field("Id", "string", false), field("OrderId", "string", true)],
        ),
        code_type(
            "Order",
            vec![field("Id", "string", false), field("UserId", "string", false)],
        ),
        code_type(
            "Invoice",
            vec![field("Id", "string", false), field("OrderId", "string", false)],
        ),
    ];
    let result = infer(&InferenceInput::new(&types, &[])).unwrap();
    let edge = |from: &str, to: &str| {
        result
            .iter()
            .find(|r| {
                r.kind == RelationshipKind::RefersTo
                    && r.source_type_id == find(&types, from).id
                    && r.target_type_id == find(&types, to).id
            })
            .unwrap()
    };
    assert!(edge("Order", "User").bidirectional);
    assert!(edge("User", "Order").bidirectional);
    assert!(!edge("Invoice", "Order").bidirectional);
}
