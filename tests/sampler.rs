use colldex::error::{Error, Result};
use colldex::model::ProvenanceStamp;
use colldex::retry::RetryPolicy;
use colldex::sampler::{DocumentSource, JsonDirSource, MemorySource, Sampler};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn stamp() -> ProvenanceStamp {
    ProvenanceStamp::new("shop", None)
}

fn users(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "_id": { "$oid": format!("{:024x}", i) },
                "name": format!("user {i}"),
                "email": format!("user{i}@example.com"),
                "status": if i % 2 == 0 { "active" } else { "disabled" },
            })
        })
        .collect()
}

#[test]
fn sample_size_is_capped_by_ceiling() {
    let source = MemorySource::new().with_collection("users", users(50));
    let sampler = Sampler::new(Arc::new(source), stamp()).with_ceiling(10);
    let schema = sampler.sample_collection("users", 1000).unwrap();
    assert_eq!(schema.sample_size, 10);
    assert_eq!(schema.collection_name, "users");
    assert_eq!(schema.fields["_id"].types.get("objectId"), Some(&10));
    assert!(schema.required_fields.contains(&"name".to_string()));
}

#[test]
fn exported_jsonl_collection_is_sampled_reproducibly() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = users(40).iter().map(|doc| doc.to_string()).collect();
    std::fs::write(dir.path().join("users.jsonl"), lines.join("\n")).unwrap();

    let sample = |seed: u64| {
        let source = JsonDirSource::new(dir.path()).with_seed(seed);
        Sampler::new(Arc::new(source), stamp())
            .with_ceiling(100)
            .sample_collection("users", 15)
            .unwrap()
    };
    let first = sample(3);
    let second = sample(3);
    assert_eq!(first.sample_size, 15);
    assert_eq!(first.fields, second.fields);
    assert!(first.provenance.file_path.ends_with("users.jsonl"));
}

#[test]
fn empty_or_missing_collection_yields_empty_schema() {
    let source = MemorySource::new().with_collection("orders", Vec::new());
    let sampler = Sampler::new(Arc::new(source), stamp());
    let empty = sampler.sample_collection("orders", 100).unwrap();
    assert_eq!(empty.sample_size, 0);
    assert!(empty.fields.is_empty());
    assert!(empty.required_fields.is_empty());
    assert!(!empty.pii_redacted);

    let missing = sampler.sample_collection("nope", 100).unwrap();
    assert_eq!(missing.sample_size, 0);
}

#[test]
fn invalid_requests_are_rejected() {
    let sampler = Sampler::new(Arc::new(MemorySource::new()), stamp());
    assert!(matches!(
        sampler.sample_collection("users", -1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        sampler.sample_collection("  ", 5),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn pii_fields_are_flagged_without_values() {
    let source = MemorySource::new().with_collection("users", users(20));
    let schema = Sampler::new(Arc::new(source), stamp())
        .sample_collection("users", 20)
        .unwrap();
    assert!(schema.pii_redacted);
    assert!(schema.pii_detections.iter().any(|d| d.field == "email"));
    assert!(!schema.enum_candidates.contains_key("email"));
    assert_eq!(
        schema.enum_candidates.get("status"),
        Some(&vec!["active".to_string(), "disabled".to_string()])
    );
    let serialized = serde_json::to_string(&schema).unwrap();
    assert!(!serialized.contains("user3@example.com"));
}

struct FlakySource {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl DocumentSource for FlakySource {
    fn list_collections(&self) -> Result<Vec<String>> {
        Ok(vec!["users".to_string()])
    }

    fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Source {
                collection: collection.to_string(),
                message: "connection reset".to_string(),
                transient: true,
            });
        }
        Ok(users(limit))
    }
}

#[test]
fn transient_source_failures_are_retried() {
    let source = Arc::new(FlakySource {
        failures_left: AtomicUsize::new(2),
        calls: AtomicUsize::new(0),
    });
    let retry = RetryPolicy {
        attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    let sampler = Sampler::new(source.clone(), stamp()).with_retry(retry);
    let schema = sampler.sample_collection("users", 5).unwrap();
    assert_eq!(schema.sample_size, 5);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn exhausted_retries_surface_the_error() {
    let source = Arc::new(FlakySource {
        failures_left: AtomicUsize::new(10),
        calls: AtomicUsize::new(0),
    });
    let sampler = Sampler::new(source.clone(), stamp()).with_retry(RetryPolicy::none());
    let err = sampler.sample_collection("users", 5).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}
