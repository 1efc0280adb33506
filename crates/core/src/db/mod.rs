//! SQLite persistence layer for the working-copy node model.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, a write-lock registry, and the transactional query surface
//! the resolver runs against ([`queries::StoreTxn`]).

pub mod queries;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ResolverConfig;
use crate::errors::DatabaseError;
use crate::paths::skip_ancestor;

pub use queries::{NodeRowInsert, StoreTxn};

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode and uses `PRAGMA foreign_keys = ON`.
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync`, enabling use inside `Arc`. The resolver itself is
/// single-threaded; the mutex only guards against misuse across threads.
pub struct Database {
    conn: Mutex<Connection>,
    /// Absolute path of the working-copy root this database describes.
    wc_root: PathBuf,
}

impl Database {
    /// Open (or create) a working-copy database at `db_path` describing the
    /// working copy rooted at `wc_root`.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        db_path: P,
        wc_root: Q,
        config: &ResolverConfig,
    ) -> Result<Self, DatabaseError> {
        let db_path = db_path.as_ref();
        info!(path = %db_path.display(), "opening working-copy database");

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};",
            config.db_busy_timeout_ms
        ))?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
            wc_root: wc_root.as_ref().to_path_buf(),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory<Q: AsRef<Path>>(wc_root: Q) -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            wc_root: wc_root.as_ref().to_path_buf(),
        })
    }

    /// Run schema migrations and register the workspace row.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing working-copy database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspaces (local_root, uuid, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_root) DO NOTHING",
            params![self.wc_root.display().to_string(), Uuid::new_v4().to_string(), now],
        )?;

        debug!("database schema is up to date");
        Ok(())
    }

    /// Absolute path of the working-copy root.
    pub fn wc_root(&self) -> &Path {
        &self.wc_root
    }

    /// Register (or look up) a repository by root URL, returning its id.
    pub fn ensure_repository(&self, root_url: &str, uuid: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO repositories (root_url, uuid) VALUES (?1, ?2)
             ON CONFLICT(root_url) DO NOTHING",
            params![root_url, uuid],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM repositories WHERE root_url = ?1",
            params![root_url],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Write locks
    // -----------------------------------------------------------------------

    /// Take a write lock on `relpath`. Locks must be taken before the
    /// resolution transaction opens; they are verified at every mutating
    /// entry point inside it.
    pub fn acquire_write_lock(&self, relpath: &str) -> Result<(), DatabaseError> {
        let wc_id = self.wc_id()?;
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO wc_locks (wc_id, local_relpath, locked_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(wc_id, local_relpath) DO NOTHING",
            params![wc_id, relpath, now],
        )?;
        debug!(path = relpath, "acquired write lock");
        Ok(())
    }

    /// Release a write lock previously taken with [`acquire_write_lock`].
    ///
    /// [`acquire_write_lock`]: Database::acquire_write_lock
    pub fn release_write_lock(&self, relpath: &str) -> Result<(), DatabaseError> {
        let wc_id = self.wc_id()?;
        self.conn().execute(
            "DELETE FROM wc_locks WHERE wc_id = ?1 AND local_relpath = ?2",
            params![wc_id, relpath],
        )?;
        debug!(path = relpath, "released write lock");
        Ok(())
    }

    /// Check (outside a transaction) whether `relpath` is covered by a lock.
    pub fn owns_write_lock(&self, relpath: &str) -> Result<bool, DatabaseError> {
        let wc_id = self.wc_id()?;
        let conn = self.conn();
        lock_covers(&conn, wc_id, relpath)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure inside a SQLite transaction against the typed
    /// store surface. If the closure returns `Ok`, the transaction is
    /// committed; otherwise it is rolled back and nothing it spooled is
    /// ever observable.
    pub fn with_txn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<DatabaseError>,
        F: FnOnce(&StoreTxn<'_>) -> Result<T, E>,
    {
        let wc_id = self.wc_id()?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let store = StoreTxn::new(tx, wc_id, self.wc_root.clone());
        let result = f(&store)?;
        store.commit().map_err(DatabaseError::from)?;
        Ok(result)
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// Prefer [`with_txn`] and the typed query surface over raw SQL.
    ///
    /// [`with_txn`]: Database::with_txn
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Workspace id of this working copy.
    pub fn wc_id(&self) -> Result<i64, DatabaseError> {
        let root = self.wc_root.display().to_string();
        self.conn()
            .query_row(
                "SELECT id FROM workspaces WHERE local_root = ?1",
                params![root],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                    entity: "workspace".into(),
                    path: root,
                },
                other => other.into(),
            })
    }
}

/// True when a `wc_locks` row exists at `relpath` or any of its ancestors.
pub(crate) fn lock_covers(
    conn: &Connection,
    wc_id: i64,
    relpath: &str,
) -> Result<bool, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT local_relpath FROM wc_locks WHERE wc_id = ?1")?;
    let rows = stmt.query_map(params![wc_id], |row| row.get::<_, String>(0))?;
    for row in rows {
        let locked = row?;
        if skip_ancestor(&locked, relpath).is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory("/wc").unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_in_memory_database() {
        let db = setup_db();
        assert!(db.wc_id().unwrap() > 0);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wc.db");
        let db = Database::open(&path, dir.path(), &ResolverConfig::default()).unwrap();
        db.initialize().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = setup_db();
        let id = db.wc_id().unwrap();
        db.initialize().unwrap();
        assert_eq!(db.wc_id().unwrap(), id);
    }

    #[test]
    fn test_ensure_repository() {
        let db = setup_db();
        let a = db.ensure_repository("https://repo.example/vcs", "uuid-1").unwrap();
        let b = db.ensure_repository("https://repo.example/vcs", "uuid-1").unwrap();
        assert_eq!(a, b);
        let c = db.ensure_repository("https://other.example/vcs", "uuid-2").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_write_locks_cover_descendants() {
        let db = setup_db();
        db.acquire_write_lock("a/b").unwrap();
        assert!(db.owns_write_lock("a/b").unwrap());
        assert!(db.owns_write_lock("a/b/c/d").unwrap());
        assert!(!db.owns_write_lock("a").unwrap());
        assert!(!db.owns_write_lock("x").unwrap());

        db.release_write_lock("a/b").unwrap();
        assert!(!db.owns_write_lock("a/b").unwrap());
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let db = setup_db();
        let result: Result<(), DatabaseError> = db.with_txn(|txn| {
            txn.raw().execute(
                "INSERT INTO actual (wc_id, local_relpath) VALUES (?1, ?2)",
                params![txn.wc_id(), "x"],
            )?;
            Err(DatabaseError::NotFound {
                entity: "forced".into(),
                path: "x".into(),
            })
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM actual", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
