use crate::config::Config;
use crate::db::Db;
use crate::drift;
use crate::indexer::csharp::CSharpExtractor;
use crate::indexer::extract::{ExtractedFile, OperationInput};
use crate::indexer::relationships::InferenceInput;
use crate::indexer::resolver::{CollectionResolver, ConstantTable};
use crate::model::{
    CodeType, CollectionMapping, FactCounts, ObservedSchema, ProvenanceStamp, QueryOperation,
    ResolutionMethod, ScanFacts, ScanSummary,
};
use crate::sampler::{DefaultPiiDetector, DocumentSource, PiiDetector, Sampler};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub mod csharp;
pub mod extract;
pub mod knowledge;
pub mod operations;
pub mod relationships;
pub mod resolver;
pub mod scan;
pub mod shape;
pub mod stable_id;
pub mod stages;
pub mod syntax;
pub mod types;

/// Per-run settings. Defaults come from [`Config`]; the CLI overrides them.
#[derive(Clone)]
pub struct ScanSettings {
    /// Repository id stamped on every fact; defaults to the root directory name.
    pub repository: Option<String>,
    /// Commit stamped on every fact; defaults to `git rev-parse HEAD`.
    pub commit: Option<String>,
    pub concurrency: usize,
    pub sample_ceiling: usize,
    pub deadline: Option<Duration>,
    pub cancel: Arc<AtomicBool>,
    pub sample_source: Option<Arc<dyn DocumentSource>>,
    pub pii_detector: Arc<dyn PiiDetector>,
    pub scan_options: scan::ScanOptions,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(Config::get())
    }
}

impl ScanSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            repository: None,
            commit: None,
            concurrency: config.concurrency.max(1),
            sample_ceiling: config.sample_ceiling,
            deadline: config.scan_timeout_secs.map(Duration::from_secs),
            cancel: Arc::new(AtomicBool::new(false)),
            sample_source: None,
            pii_detector: Arc::new(DefaultPiiDetector),
            scan_options: scan::ScanOptions::default(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_sample_source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.sample_source = Some(source);
        self
    }

    pub fn with_pii_detector(mut self, detector: Arc<dyn PiiDetector>) -> Self {
        self.pii_detector = detector;
        self
    }
}

/// Facts of one analysis run and the report describing it.
#[derive(Debug, Default)]
pub struct Analysis {
    pub facts: ScanFacts,
    pub summary: ScanSummary,
}

enum FileOutcome {
    Extracted(Box<(scan::ScannedFile, ExtractedFile)>),
    Skipped,
    Cancelled,
}

pub struct Indexer {
    repo_root: PathBuf,
    db: Db,
    settings: ScanSettings,
}

impl Indexer {
    pub fn new(repo_root: PathBuf, db_path: PathBuf) -> Result<Self> {
        Self::with_settings(repo_root, db_path, ScanSettings::default())
    }

    pub fn with_settings(repo_root: PathBuf, db_path: PathBuf, settings: ScanSettings) -> Result<Self> {
        let repo_root = std::fs::canonicalize(&repo_root).unwrap_or(repo_root);
        let db = Db::open(&db_path)
            .with_context(|| format!("open knowledge store {}", db_path.display()))?;
        Ok(Self {
            repo_root,
            db,
            settings,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut ScanSettings {
        &mut self.settings
    }

    fn stamp(&self) -> ProvenanceStamp {
        let repository = self
            .settings
            .repository
            .clone()
            .unwrap_or_else(|| crate::util::repository_name(&self.repo_root));
        let commit = self
            .settings
            .commit
            .clone()
            .or_else(|| crate::util::git_head_sha(&self.repo_root));
        ProvenanceStamp::new(repository, commit)
    }

    /// Analyze the repository and write every fact to the store.
    pub fn scan(&self) -> Result<ScanSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let Analysis { facts, mut summary } = self.analyze()?;

        let outcome = self.db.write_facts(&facts);
        summary.failed_writes = outcome.failed;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        if let Err(err) = self.db.record_scan(&summary, started_at, Utc::now()) {
            tracing::warn!("failed to record scan run: {}", err);
        }
        tracing::info!(
            "scan of {} finished: {} files, {} types, {} mappings, {} operations, {} relationships, {} failed writes ({} ms)",
            summary.repository,
            summary.files_scanned,
            summary.extracted.code_types,
            summary.extracted.collection_mappings,
            summary.extracted.query_operations,
            summary.extracted.data_relationships,
            summary.failed_writes,
            summary.duration_ms
        );
        Ok(summary)
    }

    /// Run the whole pipeline without touching the store.
    pub fn analyze(&self) -> Result<Analysis> {
        let started = Instant::now();
        let stamp = self.stamp();
        let files = scan::scan_repo_with_options(&self.repo_root, self.settings.scan_options)
            .with_context(|| format!("enumerate {}", self.repo_root.display()))?;
        tracing::info!(
            "scanning {} C# files in {} with {} workers",
            files.len(),
            self.repo_root.display(),
            self.settings.concurrency
        );

        let mut summary = ScanSummary {
            repository: stamp.repository.clone(),
            commit: stamp.commit.clone(),
            files_scanned: files.len(),
            ..Default::default()
        };

        let outcomes = self.extract_files(&files, started)?;
        let mut extracted = Vec::new();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Extracted(file) => {
                    summary.files_extracted += 1;
                    extracted.push(*file);
                }
                FileOutcome::Skipped => summary.files_skipped += 1,
                FileOutcome::Cancelled => summary.files_cancelled += 1,
            }
        }
        if summary.files_cancelled > 0 {
            tracing::warn!(
                "scan cancelled before {} of {} files",
                summary.files_cancelled,
                summary.files_scanned
            );
        }

        let mut facts = ScanFacts::default();
        let mut constants = ConstantTable::new();
        let mut hint_sites = Vec::new();
        for (_, file) in &extracted {
            constants.extend(&file.constants);
            hint_sites.extend(file.hint_sites.iter().cloned());
        }
        facts.code_types = build_code_types(&extracted, &stamp);

        let resolver = CollectionResolver::new(constants, stamp.clone());
        facts.collection_mappings = resolver.reconcile(&facts.code_types, &hint_sites);
        facts.query_operations = build_operations(
            &extracted,
            &facts.code_types,
            &facts.collection_mappings,
            &resolver,
            &stamp,
        );

        if let Some(source) = &self.settings.sample_source {
            let (schemas, failures) =
                self.sample_mapped(source.clone(), &facts.collection_mappings, &stamp, started);
            facts.observed_schemas = schemas;
            summary.sample_failures = failures;
        }

        let input = InferenceInput::new(&facts.code_types, &facts.query_operations)
            .with_mappings(&facts.collection_mappings)
            .with_schemas(&facts.observed_schemas);
        facts.data_relationships = relationships::infer(&input)?;
        facts.drift_signals = drift::detect(
            &facts.code_types,
            &facts.collection_mappings,
            &facts.observed_schemas,
        );
        facts.kb_entries = knowledge::build_entries(&facts);

        summary.extracted = FactCounts::from(&facts);
        summary.duration_ms = started.elapsed().as_millis() as u64;
        Ok(Analysis { facts, summary })
    }

    fn is_cancelled(&self, started: Instant) -> bool {
        if self.settings.cancel.load(Ordering::Relaxed) {
            return true;
        }
        match self.settings.deadline {
            Some(deadline) if started.elapsed() >= deadline => {
                self.settings.cancel.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    fn extract_files(&self, files: &[scan::ScannedFile], started: Instant) -> Result<Vec<FileOutcome>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.concurrency.max(1))
            .build()
            .map_err(|err| anyhow!("build extraction pool: {err}"))?;
        let outcomes = pool.install(|| {
            files
                .par_iter()
                .map_init(CSharpExtractor::new, |extractor, file| {
                    if self.is_cancelled(started) {
                        return FileOutcome::Cancelled;
                    }
                    let extractor = match extractor {
                        Ok(extractor) => extractor,
                        Err(err) => {
                            tracing::warn!("{}: no parser available: {}", file.rel_path, err);
                            return FileOutcome::Skipped;
                        }
                    };
                    let source = match crate::util::read_to_string(&file.abs_path) {
                        Ok(source) => source,
                        Err(err) => {
                            tracing::warn!("read error {}: {:#}", file.rel_path, err);
                            return FileOutcome::Skipped;
                        }
                    };
                    match extractor.extract(&source, &file.rel_path) {
                        Ok(extracted) => FileOutcome::Extracted(Box::new((file.clone(), extracted))),
                        Err(err) => {
                            tracing::warn!("extract error {}: {}", file.rel_path, err);
                            FileOutcome::Skipped
                        }
                    }
                })
                .collect()
        });
        Ok(outcomes)
    }

    fn sampler(&self, source: Arc<dyn DocumentSource>, stamp: &ProvenanceStamp) -> Sampler {
        Sampler::new(source, stamp.clone())
            .with_detector(self.settings.pii_detector.clone())
            .with_ceiling(self.settings.sample_ceiling)
    }

    /// Sample every collection some type maps to. Failures are isolated per
    /// collection and counted.
    fn sample_mapped(
        &self,
        source: Arc<dyn DocumentSource>,
        mappings: &[CollectionMapping],
        stamp: &ProvenanceStamp,
        started: Instant,
    ) -> (Vec<ObservedSchema>, usize) {
        let sampler = self.sampler(source, stamp);
        let available: Option<HashSet<String>> = match sampler.list_collections() {
            Ok(names) => Some(names.into_iter().collect()),
            Err(err) => {
                tracing::warn!("cannot list sample collections: {}", err);
                None
            }
        };
        let collections: BTreeSet<&str> = mappings
            .iter()
            .filter(|m| m.is_primary)
            .map(|m| m.collection_name.as_str())
            .collect();

        let mut schemas = Vec::new();
        let mut failures = 0;
        for collection in collections {
            if self.is_cancelled(started) {
                break;
            }
            if let Some(available) = &available {
                if !available.contains(collection) {
                    tracing::debug!("{}: not present in sample source", collection);
                    continue;
                }
            }
            match sampler.sample_collection(collection, sampler.ceiling() as i64) {
                Ok(mut schema) => {
                    schema.collection_mapping_id = primary_mapping_for(mappings, collection);
                    schemas.push(schema);
                }
                Err(err) => {
                    tracing::warn!("sampling {} failed: {}", collection, err);
                    failures += 1;
                }
            }
        }
        (schemas, failures)
    }

    /// Sample one collection outside a scan and store its schema.
    pub fn sample(&self, collection: &str, requested: i64) -> Result<ObservedSchema> {
        let source = self
            .settings
            .sample_source
            .clone()
            .ok_or_else(|| anyhow!("no sample source configured"))?;
        let stamp = self.stamp();
        let mut schema = self.sampler(source, &stamp).sample_collection(collection, requested)?;
        let mappings = self.db.mappings_for_collection(collection)?;
        schema.collection_mapping_id = primary_mapping_for(&mappings, collection);

        let mut facts = ScanFacts {
            observed_schemas: vec![schema.clone()],
            ..Default::default()
        };
        facts.kb_entries = knowledge::build_entries(&facts);
        let outcome = self.db.write_facts(&facts);
        if outcome.failed > 0 {
            tracing::warn!("{} facts for {} not written", outcome.failed, collection);
        }
        Ok(schema)
    }
}

fn primary_mapping_for(mappings: &[CollectionMapping], collection: &str) -> Option<String> {
    mappings
        .iter()
        .filter(|m| m.collection_name == collection)
        .max_by(|a, b| {
            a.is_primary.cmp(&b.is_primary).then_with(|| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        })
        .map(|m| m.id.clone())
}

/// Stamp extracted types. Partial declarations of the same type in one file
/// merge their members.
fn build_code_types(
    extracted: &[(scan::ScannedFile, ExtractedFile)],
    stamp: &ProvenanceStamp,
) -> Vec<CodeType> {
    let mut types: Vec<CodeType> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (file, output) in extracted {
        let module = if file.module.is_empty() {
            stamp.repository.clone()
        } else {
            file.module.clone()
        };
        for input in &output.types {
            let id = stable_id::code_type_id(&stamp.repository, &file.rel_path, &input.qualname());
            if let Some(&existing) = index.get(&id) {
                let merged = &mut types[existing];
                for field in &input.fields {
                    if merged.field(&field.name).is_none() {
                        merged.fields.push(field.clone());
                    }
                }
                continue;
            }
            index.insert(id.clone(), types.len());
            types.push(CodeType {
                id,
                name: input.name.clone(),
                namespace: input.namespace.clone(),
                module: module.clone(),
                fields: input.fields.clone(),
                attributes: input.attributes.clone(),
                discriminators: input.discriminators.clone(),
                base_type: input.base_type.clone(),
                provenance: stamp.stamp(&input.span),
            });
        }
    }
    types
}

/// Stamp operations and attach each to a collection mapping.
fn build_operations(
    extracted: &[(scan::ScannedFile, ExtractedFile)],
    types: &[CodeType],
    mappings: &[CollectionMapping],
    resolver: &CollectionResolver,
    stamp: &ProvenanceStamp,
) -> Vec<QueryOperation> {
    let mut types_by_name: HashMap<&str, &CodeType> = HashMap::new();
    for code_type in types {
        types_by_name.entry(code_type.name.as_str()).or_insert(code_type);
    }
    let mut mappings_by_type: HashMap<&str, Vec<&CollectionMapping>> = HashMap::new();
    for mapping in mappings {
        mappings_by_type
            .entry(mapping.code_type_id.as_str())
            .or_default()
            .push(mapping);
    }

    let mut seen = HashSet::new();
    let mut operations = Vec::new();
    for (file, output) in extracted {
        for input in &output.operations {
            let id = stable_id::query_operation_id(
                &stamp.repository,
                &file.rel_path,
                &input.span.symbol,
                input.kind,
                input.ordinal,
            );
            if !seen.insert(id.clone()) {
                continue;
            }
            let (mapping_id, collection) =
                attach_mapping(input, &types_by_name, &mappings_by_type, mappings, resolver);
            if mapping_id.is_none() {
                tracing::debug!(
                    "{}:{}: {} has no collection mapping",
                    file.rel_path,
                    input.span.start_line,
                    input.kind
                );
            }
            operations.push(QueryOperation {
                id,
                kind: input.kind,
                collection_mapping_id: mapping_id,
                collection_name: collection,
                document_type: input.document_type.clone(),
                collection_hint: input.hint.clone(),
                filter: input.filter.clone(),
                projection: input.projection.clone(),
                sort: input.sort.clone(),
                update: input.update.clone(),
                limit: input.limit,
                skip: input.skip,
                stages: input.stages.clone(),
                transactional: input.transactional,
                provenance: stamp.stamp(&input.span),
            });
        }
    }
    operations
}

/// Mapping id and collection name for one operation. A typed handle uses
/// its document type's mapping (the one matching the handle's hint, else the
/// primary); an untyped handle only gets a collection when its hint resolves.
fn attach_mapping(
    input: &OperationInput,
    types_by_name: &HashMap<&str, &CodeType>,
    mappings_by_type: &HashMap<&str, Vec<&CollectionMapping>>,
    mappings: &[CollectionMapping],
    resolver: &CollectionResolver,
) -> (Option<String>, Option<String>) {
    let code_type = input
        .document_type
        .as_deref()
        .and_then(|name| types_by_name.get(name));
    if let Some(code_type) = code_type {
        let candidates = mappings_by_type
            .get(code_type.id.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if let Some(hint) = &input.hint {
            let resolution = resolver.resolve_name(Some(hint), &code_type.name);
            if let Some(mapping) = candidates
                .iter()
                .find(|m| m.collection_name == resolution.collection_name)
            {
                return (Some(mapping.id.clone()), Some(mapping.collection_name.clone()));
            }
        }
        if let Some(primary) = candidates.iter().find(|m| m.is_primary) {
            return (Some(primary.id.clone()), Some(primary.collection_name.clone()));
        }
        return (None, None);
    }

    let Some(hint) = &input.hint else {
        return (None, None);
    };
    let resolution = resolver.resolve_name(Some(hint), "");
    if resolution.method == ResolutionMethod::Inferred {
        return (None, None);
    }
    let mapping_id = primary_mapping_for(mappings, &resolution.collection_name);
    (mapping_id, Some(resolution.collection_name))
}
