//! Error taxonomy for the analysis pipeline.
//!
//! Component entry points return [`Error`]; the knowledge store returns
//! [`StoreError`]. Both expose `is_transient()` so the retry loop can tell a
//! busy database or a flaky sampling connection apart from a real failure.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Null, negative, or malformed input to a public entry point.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to parse {path}")]
    Parse { path: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sample source error for collection '{collection}': {message}")]
    Source {
        collection: String,
        message: String,
        transient: bool,
    },

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Error::Source { transient, .. } => *transient,
            Error::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialize fact: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Busy/locked databases and pool checkout timeouts are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Pool(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_sqlite_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            None,
        );
        assert!(StoreError::from(busy).is_transient());
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            None,
        );
        assert!(!StoreError::from(constraint).is_transient());
    }

    #[test]
    fn invalid_argument_is_never_transient() {
        assert!(!Error::invalid_argument("negative sample size").is_transient());
        let source = Error::Source {
            collection: "users".into(),
            message: "timeout".into(),
            transient: true,
        };
        assert!(source.is_transient());
    }
}
