use crate::error::{Error, Result};
use crate::util::normalize_path;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Read-only access to live documents. Implementations may be slow or flaky;
/// transient failures are reported through [`Error::Source`] with
/// `transient: true` and retried by the sampler.
pub trait DocumentSource: Send + Sync {
    fn list_collections(&self) -> Result<Vec<String>>;

    /// Up to `limit` documents of `collection`. A collection that does not
    /// exist yields no documents.
    fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Value>>;

    /// Where the documents of `collection` come from, for provenance.
    fn location(&self, collection: &str) -> String {
        format!("collection:{collection}")
    }
}

/// Exported collections on disk: `<dir>/<collection>.jsonl` (one document
/// per line) or `<dir>/<collection>.json` (an array or a single document).
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
    seed: Option<u64>,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seed: None,
        }
    }

    /// Fixed seed for reproducible samples.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn collection_file(&self, collection: &str) -> Option<PathBuf> {
        ["jsonl", "json"]
            .iter()
            .map(|ext| self.dir.join(format!("{collection}.{ext}")))
            .find(|path| path.is_file())
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

fn source_error(collection: &str, path: &Path, err: io::Error) -> Error {
    let transient = matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    );
    Error::Source {
        collection: collection.to_string(),
        message: format!("{}: {err}", path.display()),
        transient,
    }
}

impl DocumentSource for JsonDirSource {
    fn list_collections(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| Error::Source {
            collection: String::new(),
            message: format!("{}: {err}", self.dir.display()),
            transient: false,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("json" | "jsonl")
                )
            })
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(path) = self.collection_file(collection) else {
            return Ok(Vec::new());
        };
        let mut rng = self.rng();
        let mut reservoir = Reservoir::new(limit);
        if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
            let file = fs::File::open(&path).map_err(|err| source_error(collection, &path, err))?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|err| source_error(collection, &path, err))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(doc) => reservoir.offer(doc, &mut rng),
                    Err(err) => tracing::warn!(
                        "{}:{}: skipping malformed document: {}",
                        path.display(),
                        idx + 1,
                        err
                    ),
                }
            }
        } else {
            let raw = fs::read_to_string(&path).map_err(|err| source_error(collection, &path, err))?;
            let parsed: Value = serde_json::from_str(&raw).map_err(|err| Error::Source {
                collection: collection.to_string(),
                message: format!("{}: {err}", path.display()),
                transient: false,
            })?;
            match parsed {
                Value::Array(docs) => {
                    for doc in docs {
                        reservoir.offer(doc, &mut rng);
                    }
                }
                doc => reservoir.offer(doc, &mut rng),
            }
        }
        Ok(reservoir.into_items())
    }

    fn location(&self, collection: &str) -> String {
        match self.collection_file(collection) {
            Some(path) => normalize_path(&path),
            None => normalize_path(&self.dir.join(collection)),
        }
    }
}

/// Uniform sample of at most `capacity` items from a stream of unknown length.
struct Reservoir<T> {
    capacity: usize,
    seen: usize,
    items: Vec<T>,
}

impl<T> Reservoir<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity.min(1024)),
        }
    }

    fn offer(&mut self, item: T, rng: &mut impl Rng) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let slot = rng.gen_range(0..self.seen);
        if slot < self.capacity {
            self.items[slot] = item;
        }
    }

    fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// In-memory collections, for callers that already hold documents.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    collections: BTreeMap<String, Vec<Value>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, docs: Vec<Value>) -> Self {
        self.collections.insert(name.into(), docs);
        self
    }
}

impl DocumentSource for MemorySource {
    fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.keys().cloned().collect())
    }

    fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reservoir_keeps_capacity() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir = Reservoir::new(5);
        for i in 0..100 {
            reservoir.offer(i, &mut rng);
        }
        let items = reservoir.into_items();
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| (0..100).contains(i)));
    }

    #[test]
    fn reads_json_and_jsonl_exports() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("users.json"),
            r#"[{"_id": {"$oid": "65a1b2c3d4e5f60718293a4b"}, "Name": "a"}, {"Name": "b"}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("orders.jsonl"),
            "{\"Total\": 1}\n\n{\"Total\": 2}\nnot json\n",
        )
        .unwrap();
        let source = JsonDirSource::new(dir.path()).with_seed(1);
        assert_eq!(source.list_collections().unwrap(), vec!["orders", "users"]);
        assert_eq!(source.sample("users", 10).unwrap().len(), 2);
        assert_eq!(source.sample("orders", 10).unwrap().len(), 2);
        assert_eq!(source.sample("orders", 1).unwrap().len(), 1);
        assert!(source.sample("missing", 10).unwrap().is_empty());
    }

    #[test]
    fn memory_source_limits() {
        let source = MemorySource::new().with_collection("tags", vec![json!({}), json!({})]);
        assert_eq!(source.sample("tags", 1).unwrap().len(), 1);
        assert!(source.sample("none", 1).unwrap().is_empty());
    }
}
