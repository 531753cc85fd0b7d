//! Durable store: two single-writer SQLite files (auth.db, jobs.db) with
//! typed operations. Writers serialize through an in-process lock; a sidecar
//! `fs2` lock file excludes other processes.

mod auth_store;
mod job_store;
mod sqlite;

use std::path::PathBuf;

pub use auth_store::{AuthStore, QuotaOverrides};
pub use job_store::{JobFilter, JobStore, LibraryEpisode, LibrarySeries, StorageEntry};
pub use sqlite::Db;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database {path} is locked by another process")]
    Locked { path: PathBuf },
    #[error("refusing to open database under '{segment}': {path}")]
    ForbiddenLocation { path: PathBuf, segment: String },
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
