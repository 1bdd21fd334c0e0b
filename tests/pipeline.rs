use colldex::db::Db;
use colldex::indexer::{Indexer, ScanSettings};
use colldex::model::{
    CodeType, DriftKind, DriftSeverity, EntityType, OperationKind, RelationshipKind,
    ResolutionMethod,
};
use colldex::sampler::MemorySource;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const MODELS: &str = r#"
namespace Shop.Models;

public class User
{
    public string Id { get; set; }
    public string Name { get; set; }
}

public class Order
{
    public string Id { get; set; }
    public string UserId { get; set; }
    public decimal Total { get; set; }
}
"#;

const REPOSITORY: &str = r#"
using MongoDB.Driver;
using Shop.Models;

namespace Shop.Data;

public class OrderRepository
{
    private readonly IMongoCollection<Order> _orders;

    public OrderRepository(IMongoCollection<Order> orders)
    {
        _orders = orders;
    }

    public List<Order> ForUser(string userId)
    {
        return _orders.Find(o => o.UserId == userId).ToList();
    }
}
"#;

fn write_repo(root: &Path) -> PathBuf {
    let repo = root.join("shop");
    std::fs::create_dir_all(repo.join("src/Models")).unwrap();
    std::fs::create_dir_all(repo.join("src/Data")).unwrap();
    std::fs::write(repo.join("src/Models/Models.cs"), MODELS).unwrap();
    std::fs::write(repo.join("src/Data/OrderRepository.cs"), REPOSITORY).unwrap();
    repo
}

fn settings() -> ScanSettings {
    ScanSettings::default()
        .with_repository("shop")
        .with_commit("c0ffee")
}

#[test]
fn scan_extracts_types_mappings_operations_and_references() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let indexer = Indexer::with_settings(repo, db_path, settings()).unwrap();

    let summary = indexer.scan().unwrap();
    assert_eq!(summary.repository, "shop");
    assert_eq!(summary.commit.as_deref(), Some("c0ffee"));
    assert_eq!(summary.files_scanned, 2);
    assert_eq!(summary.files_extracted, 2);
    assert_eq!(summary.failed_writes, 0);

    let db = indexer.db();
    let types: Vec<CodeType> = db.list_all().unwrap();
    let mut names: Vec<&str> = types.iter().map(|t| t.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["Order", "User"]);
    for code_type in &types {
        assert_eq!(code_type.provenance.repository, "shop");
        assert_eq!(code_type.provenance.commit.as_deref(), Some("c0ffee"));
        assert_eq!(code_type.namespace, "Shop.Models");
    }

    let order = db.types_by_name("Order").unwrap().pop().unwrap();
    let user = db.types_by_name("Shop.Models.User").unwrap().pop().unwrap();

    let order_mappings = db.mappings_for_type(&order.id).unwrap();
    assert_eq!(order_mappings.len(), 1);
    assert_eq!(order_mappings[0].collection_name, "orders");
    assert_eq!(order_mappings[0].method, ResolutionMethod::Inferred);
    assert_eq!(order_mappings[0].confidence, 0.6);
    assert_eq!(db.mappings_for_collection("users").unwrap().len(), 1);

    let finds = db.operations_by_kind(OperationKind::Find).unwrap();
    assert_eq!(finds.len(), 1);
    let find = &finds[0];
    assert_eq!(find.collection_name.as_deref(), Some("orders"));
    assert_eq!(find.collection_mapping_id.as_deref(), Some(order_mappings[0].id.as_str()));
    assert_eq!(find.provenance.file_path, "src/Data/OrderRepository.cs");
    assert_eq!(find.provenance.symbol, "Shop.Data.OrderRepository.ForUser");
    assert!(find.filter.as_ref().unwrap().mentions_field("UserId"));

    let relationships = db.relationships_for_type(&order.id).unwrap();
    let refers = relationships
        .iter()
        .find(|r| r.kind == RelationshipKind::RefersTo)
        .unwrap();
    assert_eq!(refers.source_type_id, order.id);
    assert_eq!(refers.target_type_id, user.id);
    assert!(refers.confidence > 0.7);
    assert!(refers.evidence.contains("UserId"));

    let overview = db.overview().unwrap();
    assert_eq!(overview.counts.code_types, 2);
    assert_eq!(overview.counts.collection_mappings, 2);
    assert_eq!(overview.counts.query_operations, 1);
    assert!(overview.counts.kb_entries >= 6);
    let last = overview.last_scan.unwrap();
    assert_eq!(last.extracted.code_types, 2);
}

#[test]
fn rescan_updates_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let indexer = Indexer::with_settings(repo.clone(), db_path.clone(), settings()).unwrap();

    indexer.scan().unwrap();
    let db = indexer.db();
    let counts = db.counts().unwrap();
    let order = db.types_by_name("Order").unwrap().pop().unwrap();
    let before = db.timestamps::<CodeType>(&order.id).unwrap().unwrap();

    // Blank lines above a declaration must not change its identity.
    let shifted = format!("\n\n\n{MODELS}");
    std::fs::write(repo.join("src/Models/Models.cs"), shifted).unwrap();
    indexer.scan().unwrap();

    assert_eq!(db.counts().unwrap().code_types, counts.code_types);
    assert_eq!(db.counts().unwrap().query_operations, counts.query_operations);
    assert_eq!(db.counts().unwrap().kb_entries, counts.kb_entries);
    let after = db.timestamps::<CodeType>(&order.id).unwrap().unwrap();
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at >= before.updated_at);
    let order = db.types_by_name("Order").unwrap().pop().unwrap();
    assert_eq!(order.provenance.start_line, 13);

    assert_eq!(db.scan_runs(10).unwrap().len(), 2);

    let reopened = Db::open(&db_path).unwrap();
    assert_eq!(reopened.counts().unwrap().code_types, counts.code_types);
}

#[test]
fn search_finds_entries_by_field_and_entity() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let indexer = Indexer::with_settings(repo, db_path, settings()).unwrap();
    indexer.scan().unwrap();
    let db = indexer.db();

    let hits = db.search("UserId", None, 20).unwrap();
    assert!(!hits.is_empty());
    let relationship_hits = db
        .search("UserId", Some(EntityType::DataRelationship), 20)
        .unwrap();
    assert_eq!(relationship_hits.len(), 1);
    assert!(relationship_hits[0].title.contains("REFERS_TO"));

    let exact = db.search("Shop.Models.User", None, 5).unwrap();
    assert_eq!(exact[0].entity_type, EntityType::CodeType);
    assert_eq!(exact[0].title, "Shop.Models.User");

    assert!(db.search("   ", None, 5).unwrap().is_empty());
    assert!(db.search("no such thing", None, 5).unwrap().is_empty());
}

#[test]
fn sampled_collections_feed_drift_detection() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let docs = (0..5)
        .map(|i| {
            json!({
                "_id": { "$oid": format!("{:024x}", i + 1) },
                "Name": format!("user {i}"),
                "Legacy": i,
            })
        })
        .collect();
    let source = MemorySource::new().with_collection("users", docs);
    let indexer = Indexer::with_settings(
        repo,
        db_path,
        settings().with_sample_source(Arc::new(source)),
    )
    .unwrap();

    let summary = indexer.scan().unwrap();
    assert_eq!(summary.extracted.observed_schemas, 1);
    assert_eq!(summary.sample_failures, 0);

    let db = indexer.db();
    let schema = db.schema_for_collection("users").unwrap().unwrap();
    assert_eq!(schema.sample_size, 5);
    let users_mapping = db.mappings_for_collection("users").unwrap().pop().unwrap();
    assert_eq!(schema.collection_mapping_id.as_deref(), Some(users_mapping.id.as_str()));
    assert!(db.schema_for_collection("orders").unwrap().is_none());

    let user = db.types_by_name("User").unwrap().pop().unwrap();
    let drift = db.drift_for_type(&user.id).unwrap();
    let legacy = drift.iter().find(|s| s.field == "Legacy").unwrap();
    assert_eq!(legacy.kind, DriftKind::UndeclaredField);
    assert_eq!(legacy.severity, DriftSeverity::Warning);
    assert!(!drift.iter().any(|s| s.field == "Id"));
}

#[test]
fn sample_command_stores_one_schema() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let source = MemorySource::new().with_collection(
        "orders",
        vec![json!({ "_id": { "$oid": "65a000000000000000000001" }, "Total": 12.5 })],
    );
    let indexer = Indexer::with_settings(
        repo,
        db_path,
        settings().with_sample_source(Arc::new(source)),
    )
    .unwrap();

    assert!(indexer.sample("orders", -5).is_err());
    let schema = indexer.sample("orders", 10).unwrap();
    assert_eq!(schema.sample_size, 1);
    assert_eq!(schema.fields["Total"].dominant_type(), Some("double"));
    let stored = indexer.db().schema_for_collection("orders").unwrap().unwrap();
    assert_eq!(stored.id, schema.id);
}

#[test]
fn cancelled_scan_reports_unstarted_files() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let indexer = Indexer::with_settings(repo, db_path, settings()).unwrap();
    indexer.settings().cancel.store(true, Ordering::Relaxed);

    let summary = indexer.scan().unwrap();
    assert_eq!(summary.files_scanned, 2);
    assert_eq!(summary.files_cancelled, 2);
    assert_eq!(summary.files_extracted, 0);
    assert_eq!(summary.extracted.code_types, 0);
    assert_eq!(indexer.db().counts().unwrap().code_types, 0);
}

#[test]
fn expired_deadline_cancels_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let repo = write_repo(dir.path());
    let db_path = repo.join(".colldex").join("colldex.sqlite");
    let mut settings = settings();
    settings.deadline = Some(Duration::ZERO);
    let indexer = Indexer::with_settings(repo, db_path, settings).unwrap();

    let analysis = indexer.analyze().unwrap();
    assert_eq!(analysis.summary.files_cancelled, 2);
    assert!(analysis.facts.code_types.is_empty());
    assert!(indexer.settings().cancel.load(Ordering::Relaxed));
}
