use crate::error::StoreError;
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS code_types (
            id TEXT PRIMARY KEY,
            repository TEXT NOT NULL,
            name TEXT NOT NULL,
            namespace TEXT NOT NULL,
            module TEXT NOT NULL,
            file_path TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_code_types_name ON code_types(name);
        CREATE INDEX IF NOT EXISTS idx_code_types_namespace ON code_types(namespace);

        CREATE TABLE IF NOT EXISTS collection_mappings (
            id TEXT PRIMARY KEY,
            code_type_id TEXT NOT NULL,
            collection_name TEXT NOT NULL,
            method TEXT NOT NULL,
            confidence REAL NOT NULL,
            is_primary INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mappings_collection ON collection_mappings(collection_name);
        CREATE INDEX IF NOT EXISTS idx_mappings_type ON collection_mappings(code_type_id);

        CREATE TABLE IF NOT EXISTS query_operations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            collection_mapping_id TEXT,
            collection_name TEXT,
            file_path TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_operations_kind ON query_operations(kind);
        CREATE INDEX IF NOT EXISTS idx_operations_mapping ON query_operations(collection_mapping_id);

        CREATE TABLE IF NOT EXISTS data_relationships (
            id TEXT PRIMARY KEY,
            source_type_id TEXT NOT NULL,
            target_type_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            confidence REAL NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_relationships_source ON data_relationships(source_type_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target ON data_relationships(target_type_id);

        CREATE TABLE IF NOT EXISTS observed_schemas (
            id TEXT PRIMARY KEY,
            collection_name TEXT NOT NULL,
            collection_mapping_id TEXT,
            sample_size INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_schemas_collection ON observed_schemas(collection_name);

        CREATE TABLE IF NOT EXISTS drift_signals (
            id TEXT PRIMARY KEY,
            code_type_id TEXT NOT NULL,
            collection_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_drift_type ON drift_signals(code_type_id);

        CREATE TABLE IF NOT EXISTS kb_entries (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            title TEXT NOT NULL,
            searchable_text TEXT NOT NULL,
            relevance REAL NOT NULL,
            active INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_kb_entity ON kb_entries(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_kb_title ON kb_entries(title);

        CREATE TABLE IF NOT EXISTS scan_runs (
            id INTEGER PRIMARY KEY,
            repository TEXT NOT NULL,
            commit_sha TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            summary TEXT NOT NULL
        );
        COMMIT;
        ",
    )?;

    let existing = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| {
                row.get::<_, String>(0)
                    .map(|v| v.parse::<i64>().unwrap_or(0))
            },
        )
        .optional()?;

    let existing = existing.unwrap_or(0);

    if existing < 2 && !has_column(conn, "query_operations", "collection_name")? {
        conn.execute(
            "ALTER TABLE query_operations ADD COLUMN collection_name TEXT",
            [],
        )?;
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operations_collection ON query_operations(collection_name)",
        [],
    )?;

    if existing < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for row in rows {
        if row? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
