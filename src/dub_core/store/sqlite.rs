use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use rusqlite::Connection;

use crate::sync_ext::MutexExt;

use super::StoreError;

/// Directory names a sensitive database must never live under. Build trees
/// and backup staging areas get copied around and committed; a runtime DB in
/// one of them is an operator error worth failing loudly on.
const FORBIDDEN_STATE_ROOTS: &[&str] = &["build", "dist", "backups", "_tmp"];

fn reject_forbidden_roots(path: &Path) -> Result<(), StoreError> {
    for component in path.components() {
        let part = component.as_os_str().to_string_lossy();
        if FORBIDDEN_STATE_ROOTS.iter().any(|bad| part.eq_ignore_ascii_case(bad)) {
            return Err(StoreError::ForbiddenLocation {
                path: path.to_path_buf(),
                segment: part.into_owned(),
            });
        }
    }
    Ok(())
}

/// Single-writer embedded database handle.
///
/// Writers serialize through the in-process connection mutex; a second
/// process is excluded by an exclusive `fs2` lock on a sidecar `.lock` file,
/// taken for the lifetime of the handle. Open fails fast on contention.
#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    conn: Mutex<Connection>,
    // Held for the lifetime of the handle; dropping releases the lock.
    _lock_file: File,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        reject_forbidden_roots(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                context: format!("create state dir {}", parent.display()),
                source,
            })?;
        }

        let lock_path = path.with_extension("db.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StoreError::Io {
                context: format!("open lock file {}", lock_path.display()),
                source,
            })?;
        lock_file.try_lock_exclusive().map_err(|_| StoreError::Locked {
            path: path.to_path_buf(),
        })?;

        let conn = Connection::open(path)?;
        // Crash safety over raw throughput: WAL keeps readers unblocked while
        // FULL sync guarantees a committed write survives power loss.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the connection under the writer lock.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock_unpoisoned();
        f(&conn).map_err(StoreError::from)
    }

    /// Run a closure inside an exclusive transaction; commits on Ok.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock_unpoisoned();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_refuses_forbidden_roots() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("build").join("state").join("auth.db");
        let err = Db::open(&bad).unwrap_err();
        assert!(matches!(err, StoreError::ForbiddenLocation { .. }), "{err}");
    }

    #[test]
    fn second_open_of_same_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let _first = Db::open(&path).unwrap();
        let err = Db::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }), "{err}");
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        drop(Db::open(&path).unwrap());
        assert!(Db::open(&path).is_ok());
    }
}
