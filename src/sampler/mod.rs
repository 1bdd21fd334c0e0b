//! Schema inference from sampled live documents.
//!
//! The sampler never retains document values. It keeps type histograms,
//! presence counts, detected string formats and, for low-cardinality non-PII
//! strings, the handful of enum-like values.

mod pii;
mod source;

pub use pii::{DefaultPiiDetector, PiiDetector, looks_like_email};
pub use source::{DocumentSource, JsonDirSource, MemorySource};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::indexer::stable_id::observed_schema_id;
use crate::model::{FieldObservation, ObservedSchema, PiiDetection, ProvenanceStamp, SourceSpan};
use crate::retry::RetryPolicy;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const MAX_ENUM_VALUES: usize = 10;
const MIN_ENUM_REPEAT: f64 = 2.0;

pub struct Sampler {
    source: Arc<dyn DocumentSource>,
    detector: Arc<dyn PiiDetector>,
    ceiling: usize,
    retry: RetryPolicy,
    stamp: ProvenanceStamp,
}

impl Sampler {
    pub fn new(source: Arc<dyn DocumentSource>, stamp: ProvenanceStamp) -> Self {
        Self {
            source,
            detector: Arc::new(DefaultPiiDetector),
            ceiling: Config::get().sample_ceiling,
            retry: RetryPolicy::default(),
            stamp,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn PiiDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.retry
            .run("list collections", || self.source.list_collections())
    }

    /// Sample `collection` and infer its schema. `requested` is capped at the
    /// configured ceiling; negative sizes are rejected.
    pub fn sample_collection(&self, collection: &str, requested: i64) -> Result<ObservedSchema> {
        if requested < 0 {
            return Err(Error::invalid_argument(format!(
                "sample size must be >= 0, got {requested}"
            )));
        }
        if collection.trim().is_empty() {
            return Err(Error::invalid_argument("collection name is empty"));
        }
        let limit = usize::try_from(requested)
            .unwrap_or(usize::MAX)
            .min(self.ceiling);
        let what = format!("sample {collection}");
        let mut docs = self
            .retry
            .run(&what, || self.source.sample(collection, limit))?;
        docs.truncate(limit);

        let mut builder = SchemaBuilder::new(self.detector.as_ref());
        for doc in &docs {
            match doc {
                Value::Object(map) => builder.add_document(map),
                _ => tracing::debug!("{}: skipping non-document sample", collection),
            }
        }
        let span = SourceSpan {
            file_path: self.source.location(collection),
            symbol: collection.to_string(),
            start_line: 0,
            end_line: 0,
        };
        let schema = builder.finish(
            observed_schema_id(&self.stamp.repository, collection),
            collection,
            self.stamp.stamp(&span),
        );
        tracing::debug!(
            "sampled {} documents from {} ({} fields, pii_redacted={})",
            schema.sample_size,
            collection,
            schema.fields.len(),
            schema.pii_redacted
        );
        Ok(schema)
    }
}

/// Observed type name, understanding MongoDB extended JSON wrappers.
pub fn observed_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(number) => match number.as_i64() {
            Some(n) if i32::try_from(n).is_ok() => "int",
            Some(_) => "long",
            None if number.is_u64() => "long",
            None => "double",
        },
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(map) => extended_type(map).unwrap_or("object"),
    }
}

fn extended_type(map: &Map<String, Value>) -> Option<&'static str> {
    let key = map.keys().next()?;
    let kind = match key.as_str() {
        "$oid" => "objectId",
        "$date" => "date",
        "$numberLong" => "long",
        "$numberInt" => "int",
        "$numberDouble" => "double",
        "$numberDecimal" => "decimal",
        "$binary" => "binary",
        "$uuid" => "uuid",
        _ => return None,
    };
    Some(kind)
}

/// Well-known string shapes.
pub fn string_format(text: &str) -> Option<&'static str> {
    if looks_like_email(text) {
        return Some("email");
    }
    if is_uuid(text) {
        return Some("uuid");
    }
    if text.len() == 24 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some("objectId");
    }
    if is_iso_date(text) {
        return Some("iso-date");
    }
    if text.starts_with("http://") || text.starts_with("https://") {
        return Some("url");
    }
    None
}

fn is_uuid(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(idx, b)| match idx {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

fn is_iso_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() < 10 {
        return false;
    }
    let date_ok = bytes[..10].iter().enumerate().all(|(idx, b)| match idx {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    date_ok && (bytes.len() == 10 || matches!(bytes[10], b'T' | b' '))
}

#[derive(Default)]
struct FieldStats {
    types: BTreeMap<String, u64>,
    present: u64,
    pii: Option<String>,
    strings: u64,
    formats: BTreeMap<&'static str, u64>,
    distinct: BTreeMap<String, u64>,
    too_many_values: bool,
}

struct SchemaBuilder<'d> {
    detector: &'d dyn PiiDetector,
    fields: BTreeMap<String, FieldStats>,
    documents: u64,
}

impl<'d> SchemaBuilder<'d> {
    fn new(detector: &'d dyn PiiDetector) -> Self {
        Self {
            detector,
            fields: BTreeMap::new(),
            documents: 0,
        }
    }

    fn add_document(&mut self, doc: &Map<String, Value>) {
        self.documents += 1;
        let mut seen = HashSet::new();
        for (key, value) in doc {
            self.visit(key.clone(), value, &mut seen);
        }
    }

    fn visit(&mut self, path: String, value: &Value, seen: &mut HashSet<String>) {
        let kind = observed_type(value);
        let detector = self.detector;
        let stats = self.fields.entry(path.clone()).or_default();
        *stats.types.entry(kind.to_string()).or_insert(0) += 1;
        if seen.insert(path.clone()) {
            stats.present += 1;
        }

        match value {
            Value::Object(map) if kind == "object" => {
                for (key, child) in map {
                    self.visit(format!("{path}.{key}"), child, seen);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.visit(format!("{path}[]"), item, seen);
                }
            }
            Value::Null => {}
            _ => {
                if stats.pii.is_none() {
                    stats.pii = detector.detect(&path, Some(value));
                }
                if stats.pii.is_some() {
                    stats.distinct.clear();
                    return;
                }
                if let Value::String(text) = value {
                    stats.strings += 1;
                    if let Some(format) = string_format(text) {
                        *stats.formats.entry(format).or_insert(0) += 1;
                    }
                    if !stats.too_many_values {
                        *stats.distinct.entry(text.clone()).or_insert(0) += 1;
                        if stats.distinct.len() > MAX_ENUM_VALUES {
                            stats.too_many_values = true;
                            stats.distinct.clear();
                        }
                    }
                }
            }
        }
    }

    fn finish(self, id: String, collection: &str, provenance: crate::model::Provenance) -> ObservedSchema {
        let total = self.documents;
        let mut fields = BTreeMap::new();
        let mut required_fields = Vec::new();
        let mut string_formats = BTreeMap::new();
        let mut enum_candidates = BTreeMap::new();
        let mut pii_detections = Vec::new();

        for (path, stats) in self.fields {
            if total > 0 && stats.present == total && !path.contains("[]") {
                required_fields.push(path.clone());
            }
            if let Some(reason) = &stats.pii {
                pii_detections.push(PiiDetection {
                    field: path.clone(),
                    reason: reason.clone(),
                });
            } else if stats.strings > 0 {
                if let Some((format, count)) = stats.formats.iter().max_by_key(|(_, count)| **count) {
                    if *count == stats.strings {
                        string_formats.insert(path.clone(), format.to_string());
                    }
                }
                let distinct = stats.distinct.len();
                if !stats.too_many_values
                    && !string_formats.contains_key(&path)
                    && distinct > 0
                    && distinct <= MAX_ENUM_VALUES
                    && stats.strings as f64 / distinct as f64 >= MIN_ENUM_REPEAT
                {
                    enum_candidates.insert(path.clone(), stats.distinct.keys().cloned().collect());
                }
            }
            let presence_ratio = if total == 0 {
                0.0
            } else {
                stats.present as f64 / total as f64
            };
            fields.insert(
                path,
                FieldObservation {
                    types: stats.types,
                    present: stats.present,
                    presence_ratio,
                },
            );
        }

        ObservedSchema {
            id,
            collection_mapping_id: None,
            collection_name: collection.to_string(),
            fields,
            required_fields,
            string_formats,
            enum_candidates,
            sample_size: total,
            pii_redacted: !pii_detections.is_empty(),
            pii_detections,
            provenance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sampler(docs: Vec<Value>) -> Sampler {
        let source = MemorySource::new().with_collection("users", docs);
        Sampler::new(Arc::new(source), ProvenanceStamp::new("shop", None))
            .with_ceiling(50)
            .with_retry(RetryPolicy::none())
    }

    #[test]
    fn extended_json_types() {
        assert_eq!(observed_type(&json!({"$oid": "65a1b2c3d4e5f60718293a4b"})), "objectId");
        assert_eq!(observed_type(&json!({"$date": "2024-01-01T00:00:00Z"})), "date");
        assert_eq!(observed_type(&json!({"$numberDecimal": "1.5"})), "decimal");
        assert_eq!(observed_type(&json!(3)), "int");
        assert_eq!(observed_type(&json!(5_000_000_000i64)), "long");
        assert_eq!(observed_type(&json!(1.5)), "double");
        assert_eq!(observed_type(&json!({"city": "Oslo"})), "object");
    }

    #[test]
    fn formats() {
        assert_eq!(string_format("2024-03-01"), Some("iso-date"));
        assert_eq!(string_format("2024-03-01T10:00:00Z"), Some("iso-date"));
        assert_eq!(string_format("3f2504e0-4f89-11d3-9a0c-0305e82c3301"), Some("uuid"));
        assert_eq!(string_format("65a1b2c3d4e5f60718293a4b"), Some("objectId"));
        assert_eq!(string_format("https://shop.io"), Some("url"));
        assert_eq!(string_format("hello"), None);
    }

    #[test]
    fn negative_size_is_invalid() {
        let err = sampler(Vec::new()).sample_collection("users", -1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn empty_collection() {
        let schema = sampler(Vec::new()).sample_collection("users", 10).unwrap();
        assert_eq!(schema.sample_size, 0);
        assert!(!schema.pii_redacted);
        assert!(schema.required_fields.is_empty());
        assert!(schema.fields.is_empty());
    }

    #[test]
    fn histograms_presence_and_nesting() {
        let docs = vec![
            json!({"_id": {"$oid": "65a1b2c3d4e5f60718293a4b"}, "Name": "a", "Tags": ["x"], "Address": {"City": "Oslo"}}),
            json!({"_id": {"$oid": "65a1b2c3d4e5f60718293a4c"}, "Name": null}),
        ];
        let schema = sampler(docs).sample_collection("users", 10).unwrap();
        assert_eq!(schema.sample_size, 2);
        assert_eq!(schema.required_fields, vec!["Name", "_id"]);
        assert_eq!(schema.fields["Name"].types["null"], 1);
        assert_eq!(schema.fields["Tags"].presence_ratio, 0.5);
        assert_eq!(schema.fields["Tags[]"].types["string"], 1);
        assert_eq!(schema.fields["Address"].types["object"], 1);
        assert_eq!(schema.fields["Address.City"].types["string"], 1);
        assert!(schema.pii_redacted);
        let detected: Vec<&str> = schema
            .pii_detections
            .iter()
            .map(|d| d.field.as_str())
            .collect();
        assert_eq!(detected, vec!["Address.City"]);
        assert!(!schema.enum_candidates.contains_key("Address.City"));
        assert_eq!(schema.fields["_id"].dominant_type(), Some("objectId"));
    }

    #[test]
    fn pii_fields_are_flagged_not_kept() {
        let docs = vec![
            json!({"Email": "a@shop.io", "Status": "active"}),
            json!({"Email": "b@shop.io", "Status": "active"}),
            json!({"Email": "c@shop.io", "Status": "banned"}),
            json!({"Email": "d@shop.io", "Status": "active"}),
        ];
        let schema = sampler(docs).sample_collection("users", 10).unwrap();
        assert!(schema.pii_redacted);
        assert_eq!(schema.pii_detections.len(), 1);
        assert_eq!(schema.pii_detections[0].field, "Email");
        assert!(!schema.enum_candidates.contains_key("Email"));
        assert_eq!(schema.enum_candidates["Status"], vec!["active", "banned"]);
    }
}
