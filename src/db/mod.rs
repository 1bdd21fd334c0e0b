//! SQLite knowledge store.
//!
//! Every fact type lives in its own table keyed by the fact's stable id, with
//! the indexed lookup columns broken out and the full fact kept as a JSON
//! payload. Writes go through one connection behind a mutex; reads use an
//! r2d2 pool.

use crate::config::Config;
use crate::error::StoreError;
use crate::model::{
    CodeType, CollectionMapping, DataRelationship, DriftSignal, EntityType, FactCounts,
    KnowledgeBaseEntry, ObservedSchema, OperationKind, QueryOperation, ScanFacts, ScanSummary,
    StoreOverview,
};
use crate::retry::RetryPolicy;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

mod migrations;

pub use migrations::SCHEMA_VERSION;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
struct ConnectionCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(())
    }

    fn on_release(&self, _conn: Connection) {}
}

/// A fact the store can upsert: its table, indexed columns and stable id.
pub trait StoredFact: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    /// Indexed columns, in the order [`StoredFact::column_values`] yields them.
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> &str;
    fn column_values(&self) -> Vec<SqlValue>;
}

fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

fn opt_text(value: Option<&str>) -> SqlValue {
    value.map(text).unwrap_or(SqlValue::Null)
}

impl StoredFact for CodeType {
    const TABLE: &'static str = "code_types";
    const COLUMNS: &'static [&'static str] =
        &["repository", "name", "namespace", "module", "file_path"];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.provenance.repository),
            text(&self.name),
            text(&self.namespace),
            text(&self.module),
            text(&self.provenance.file_path),
        ]
    }
}

impl StoredFact for CollectionMapping {
    const TABLE: &'static str = "collection_mappings";
    const COLUMNS: &'static [&'static str] = &[
        "code_type_id",
        "collection_name",
        "method",
        "confidence",
        "is_primary",
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.code_type_id),
            text(&self.collection_name),
            text(self.method.as_str()),
            SqlValue::Real(self.confidence),
            SqlValue::Integer(i64::from(self.is_primary)),
        ]
    }
}

impl StoredFact for QueryOperation {
    const TABLE: &'static str = "query_operations";
    const COLUMNS: &'static [&'static str] =
        &["kind", "collection_mapping_id", "collection_name", "file_path"];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(self.kind.as_str()),
            opt_text(self.collection_mapping_id.as_deref()),
            opt_text(self.collection_name.as_deref()),
            text(&self.provenance.file_path),
        ]
    }
}

impl StoredFact for DataRelationship {
    const TABLE: &'static str = "data_relationships";
    const COLUMNS: &'static [&'static str] =
        &["source_type_id", "target_type_id", "kind", "confidence"];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.source_type_id),
            text(&self.target_type_id),
            text(self.kind.as_str()),
            SqlValue::Real(self.confidence),
        ]
    }
}

impl StoredFact for ObservedSchema {
    const TABLE: &'static str = "observed_schemas";
    const COLUMNS: &'static [&'static str] =
        &["collection_name", "collection_mapping_id", "sample_size"];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.collection_name),
            opt_text(self.collection_mapping_id.as_deref()),
            SqlValue::Integer(i64::try_from(self.sample_size).unwrap_or(i64::MAX)),
        ]
    }
}

impl StoredFact for DriftSignal {
    const TABLE: &'static str = "drift_signals";
    const COLUMNS: &'static [&'static str] =
        &["code_type_id", "collection_name", "kind", "severity"];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.code_type_id),
            text(&self.collection_name),
            text(self.kind.as_str()),
            text(self.severity.as_str()),
        ]
    }
}

impl StoredFact for KnowledgeBaseEntry {
    const TABLE: &'static str = "kb_entries";
    const COLUMNS: &'static [&'static str] = &[
        "entity_type",
        "entity_id",
        "title",
        "searchable_text",
        "relevance",
        "active",
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            text(self.entity_type.as_str()),
            text(&self.entity_id),
            text(&self.title),
            text(&self.searchable_text),
            SqlValue::Real(self.relevance),
            SqlValue::Integer(i64::from(self.active)),
        ]
    }
}

fn upsert_sql<T: StoredFact>() -> String {
    let mut columns = vec!["id"];
    columns.extend_from_slice(T::COLUMNS);
    columns.extend_from_slice(&["payload", "created_at", "updated_at"]);
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates: Vec<String> = T::COLUMNS
        .iter()
        .chain(["payload", "updated_at"].iter())
        .map(|column| format!("{column} = excluded.{column}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        T::TABLE,
        columns.join(", "),
        placeholders,
        updates.join(", ")
    )
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Result of a batched write. Failed chunks are counted, not raised.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for WriteOutcome {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Stored creation and update timestamps of one fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactTimestamps {
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRun {
    pub id: i64,
    pub repository: String,
    pub commit: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub summary: ScanSummary,
}

pub struct Db {
    db_path: PathBuf,
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
    write_batch: usize,
    retry: RetryPolicy,
}

impl Db {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        Self::open_with_config(db_path, Config::get())
    }

    pub fn open_with_config(db_path: &Path, config: &Config) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!(
            "opening store {} (pool size: {}, min_idle: {})",
            db_path.display(),
            config.pool_size,
            config.pool_min_idle
        );

        let write_conn = Connection::open(db_path)?;
        write_conn.busy_timeout(config.op_timeout())?;
        write_conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        migrations::migrate(&write_conn)?;

        let write_conn = Arc::new(Mutex::new(write_conn));

        let manager = SqliteConnectionManager::file(db_path);
        let read_pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(config.pool_min_idle.min(config.pool_size)))
            .connection_timeout(config.op_timeout())
            .connection_customizer(Box::new(ConnectionCustomizer {
                busy_timeout: config.op_timeout(),
            }))
            .build(manager)?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            write_conn,
            read_pool,
            write_batch: config.write_batch.max(1),
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn read_conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.read_pool.get()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.write_conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert `facts` in chunks, one transaction per chunk. Transient
    /// failures are retried; chunks that still fail are counted.
    pub fn upsert<T: StoredFact>(&self, facts: &[T]) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        let what = format!("write {}", T::TABLE);
        for chunk in facts.chunks(self.write_batch) {
            match self.retry.run(&what, || self.upsert_chunk(chunk)) {
                Ok(written) => outcome.written += written,
                Err(err) => {
                    tracing::warn!("{}: {} facts not written: {}", T::TABLE, chunk.len(), err);
                    outcome.failed += chunk.len();
                }
            }
        }
        outcome
    }

    fn upsert_chunk<T: StoredFact>(&self, chunk: &[T]) -> StoreResult<usize> {
        let sql = upsert_sql::<T>();
        let now = timestamp(Utc::now());
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for fact in chunk {
                let payload = serde_json::to_string(fact)?;
                let mut values = Vec::with_capacity(T::COLUMNS.len() + 4);
                values.push(text(fact.id()));
                values.extend(fact.column_values());
                values.push(SqlValue::Text(payload));
                values.push(text(&now));
                values.push(text(&now));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(chunk.len())
    }

    /// Write every fact of one scan, fact type by fact type.
    pub fn write_facts(&self, facts: &ScanFacts) -> WriteOutcome {
        let mut outcome = self.upsert(&facts.code_types);
        outcome += self.upsert(&facts.collection_mappings);
        outcome += self.upsert(&facts.query_operations);
        outcome += self.upsert(&facts.data_relationships);
        outcome += self.upsert(&facts.observed_schemas);
        outcome += self.upsert(&facts.drift_signals);
        outcome += self.upsert(&facts.kb_entries);
        outcome
    }

    fn query_payloads<T, P>(&self, sql: &str, params: P) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        P: rusqlite::Params,
    {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn get<T: StoredFact>(&self, id: &str) -> StoreResult<Option<T>> {
        let sql = format!("SELECT payload FROM {} WHERE id = ?", T::TABLE);
        let payload: Option<String> = self
            .read_conn()?
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn list<T: StoredFact>(&self, limit: usize, offset: usize) -> StoreResult<Vec<T>> {
        let sql = format!(
            "SELECT payload FROM {} ORDER BY id LIMIT ? OFFSET ?",
            T::TABLE
        );
        self.query_payloads(&sql, params![limit as i64, offset as i64])
    }

    pub fn list_all<T: StoredFact>(&self) -> StoreResult<Vec<T>> {
        let sql = format!("SELECT payload FROM {} ORDER BY id", T::TABLE);
        self.query_payloads(&sql, [])
    }

    pub fn count<T: StoredFact>(&self) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", T::TABLE);
        let count: i64 = self.read_conn()?.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn counts(&self) -> StoreResult<FactCounts> {
        Ok(FactCounts {
            code_types: self.count::<CodeType>()?,
            collection_mappings: self.count::<CollectionMapping>()?,
            query_operations: self.count::<QueryOperation>()?,
            data_relationships: self.count::<DataRelationship>()?,
            observed_schemas: self.count::<ObservedSchema>()?,
            drift_signals: self.count::<DriftSignal>()?,
            kb_entries: self.count::<KnowledgeBaseEntry>()?,
        })
    }

    pub fn timestamps<T: StoredFact>(&self, id: &str) -> StoreResult<Option<FactTimestamps>> {
        let sql = format!(
            "SELECT created_at, updated_at FROM {} WHERE id = ?",
            T::TABLE
        );
        Ok(self
            .read_conn()?
            .query_row(&sql, params![id], |row| {
                Ok(FactTimestamps {
                    created_at: row.get(0)?,
                    updated_at: row.get(1)?,
                })
            })
            .optional()?)
    }

    /// Types whose simple or qualified name equals `name`.
    pub fn types_by_name(&self, name: &str) -> StoreResult<Vec<CodeType>> {
        self.query_payloads(
            "SELECT payload FROM code_types
             WHERE name = ?1 OR (namespace <> '' AND namespace || '.' || name = ?1)
             ORDER BY namespace, name",
            params![name],
        )
    }

    pub fn types_in_namespace(&self, namespace: &str) -> StoreResult<Vec<CodeType>> {
        self.query_payloads(
            "SELECT payload FROM code_types WHERE namespace = ? ORDER BY name",
            params![namespace],
        )
    }

    pub fn mappings_for_collection(&self, collection: &str) -> StoreResult<Vec<CollectionMapping>> {
        self.query_payloads(
            "SELECT payload FROM collection_mappings
             WHERE collection_name = ?
             ORDER BY is_primary DESC, confidence DESC, id",
            params![collection],
        )
    }

    pub fn mappings_for_type(&self, code_type_id: &str) -> StoreResult<Vec<CollectionMapping>> {
        self.query_payloads(
            "SELECT payload FROM collection_mappings
             WHERE code_type_id = ?
             ORDER BY is_primary DESC, confidence DESC, id",
            params![code_type_id],
        )
    }

    pub fn operations_by_kind(&self, kind: OperationKind) -> StoreResult<Vec<QueryOperation>> {
        self.query_payloads(
            "SELECT payload FROM query_operations WHERE kind = ? ORDER BY file_path, id",
            params![kind.as_str()],
        )
    }

    pub fn operations_for_collection(&self, collection: &str) -> StoreResult<Vec<QueryOperation>> {
        self.query_payloads(
            "SELECT payload FROM query_operations
             WHERE collection_name = ?
             ORDER BY file_path, id",
            params![collection],
        )
    }

    /// Relationships where the type is either end, strongest first.
    pub fn relationships_for_type(&self, code_type_id: &str) -> StoreResult<Vec<DataRelationship>> {
        self.query_payloads(
            "SELECT payload FROM data_relationships
             WHERE source_type_id = ?1 OR target_type_id = ?1
             ORDER BY confidence DESC, id",
            params![code_type_id],
        )
    }

    pub fn drift_for_type(&self, code_type_id: &str) -> StoreResult<Vec<DriftSignal>> {
        self.query_payloads(
            "SELECT payload FROM drift_signals WHERE code_type_id = ? ORDER BY severity DESC, id",
            params![code_type_id],
        )
    }

    pub fn schema_for_collection(&self, collection: &str) -> StoreResult<Option<ObservedSchema>> {
        let mut schemas: Vec<ObservedSchema> = self.query_payloads(
            "SELECT payload FROM observed_schemas
             WHERE collection_name = ?
             ORDER BY updated_at DESC LIMIT 1",
            params![collection],
        )?;
        Ok(schemas.pop())
    }

    /// Distinct collection names with at least one mapping.
    pub fn collection_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT collection_name FROM collection_mappings ORDER BY collection_name",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Free-text search over knowledge base entries. Exact title matches
    /// rank first, then title prefixes, then relevance.
    pub fn search(
        &self,
        query: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> StoreResult<Vec<KnowledgeBaseEntry>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let escaped = escape_like(query);
        let contains = format!("%{escaped}%");
        let prefix = format!("{escaped}%");
        let mut values = vec![
            text(&contains),
            text(&contains),
            text(query),
            text(&prefix),
        ];
        let mut sql = String::from(
            "SELECT payload FROM kb_entries
             WHERE active = 1
               AND (title LIKE ?1 ESCAPE '\\' OR searchable_text LIKE ?2 ESCAPE '\\')",
        );
        if let Some(entity_type) = entity_type {
            sql.push_str(" AND entity_type = ?5");
            values.push(text(entity_type.as_str()));
        }
        sql.push_str(
            " ORDER BY CASE
                 WHEN lower(title) = lower(?3) THEN 0
                 WHEN title LIKE ?4 ESCAPE '\\' THEN 1
                 ELSE 2
               END,
               relevance DESC,
               title",
        );
        sql.push_str(&format!(" LIMIT {}", limit.min(i64::MAX as usize)));
        self.query_payloads(&sql, params_from_iter(values))
    }

    pub fn record_scan(
        &self,
        summary: &ScanSummary,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let payload = serde_json::to_string(summary)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scan_runs (repository, commit_sha, started_at, finished_at, summary)
             VALUES (?, ?, ?, ?, ?)",
            params![
                summary.repository,
                summary.commit,
                timestamp(started_at),
                timestamp(finished_at),
                payload
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn scan_runs(&self, limit: usize) -> StoreResult<Vec<ScanRun>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, repository, commit_sha, started_at, finished_at, summary
             FROM scan_runs
             ORDER BY id DESC
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut runs = Vec::new();
        for row in rows {
            let (id, repository, commit, started_at, finished_at, summary) = row?;
            runs.push(ScanRun {
                id,
                repository,
                commit,
                started_at,
                finished_at,
                summary: serde_json::from_str(&summary)?,
            });
        }
        Ok(runs)
    }

    pub fn last_scan(&self) -> StoreResult<Option<ScanSummary>> {
        Ok(self.scan_runs(1)?.pop().map(|run| run.summary))
    }

    pub fn overview(&self) -> StoreResult<StoreOverview> {
        Ok(StoreOverview {
            db_path: self.db_path.to_string_lossy().to_string(),
            counts: self.counts()?,
            last_scan: self.last_scan()?,
        })
    }

    pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .read_conn()?
            .query_row(
                "SELECT value FROM meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_sql_preserves_created_at() {
        let sql = upsert_sql::<DataRelationship>();
        assert!(sql.starts_with("INSERT INTO data_relationships (id, source_type_id"));
        assert!(sql.contains("ON CONFLICT(id) DO UPDATE SET"));
        assert!(sql.contains("updated_at = excluded.updated_at"));
        assert!(!sql.contains("created_at = excluded.created_at"));
    }

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("user_id%"), "user\\_id\\%");
        assert_eq!(escape_like("orders"), "orders");
    }
}
