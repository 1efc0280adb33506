//! Deferred filesystem work items.
//!
//! The resolver never touches working files directly. Every required file
//! effect is spooled as a [`WorkItem`] inside the resolution transaction and
//! handed to an external [`WorkQueueExecutor`] after commit, in insertion
//! order. Executors must be idempotent on replay: running an item whose
//! target is already in the requested state (or gone) succeeds.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::Database;
use crate::errors::{CoreError, DatabaseError};
use crate::models::Checksum;

/// A single deferred filesystem action. Paths are working-copy relpaths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkItem {
    /// Install a file from pristine content. `source = None` materializes
    /// the file from the checksum recorded on the node row at run time.
    FileInstall {
        path: String,
        source: Option<Checksum>,
        use_commit_times: bool,
        record_info: bool,
    },
    /// Create a directory.
    DirInstall { path: String },
    /// Remove a file.
    FileRemove { path: String },
    /// Remove a directory.
    DirRemove { path: String, recursive: bool },
    /// Write merged file content produced by the file merger.
    FileWrite { path: String, contents: String },
    /// Write a conflict-marker file next to `path`.
    ConflictMarkers { path: String, contents: String },
}

impl WorkItem {
    /// The working-copy path this item operates on.
    pub fn path(&self) -> &str {
        match self {
            Self::FileInstall { path, .. }
            | Self::DirInstall { path }
            | Self::FileRemove { path }
            | Self::DirRemove { path, .. }
            | Self::FileWrite { path, .. }
            | Self::ConflictMarkers { path, .. } => path,
        }
    }
}

/// External executor performing the file effects of spooled work items.
pub trait WorkQueueExecutor {
    fn run(&mut self, item: &WorkItem) -> std::io::Result<()>;
}

impl<F> WorkQueueExecutor for F
where
    F: FnMut(&WorkItem) -> std::io::Result<()>,
{
    fn run(&mut self, item: &WorkItem) -> std::io::Result<()> {
        self(item)
    }
}

/// Read back every spooled work item in insertion order without running it.
pub fn peek_work_queue(db: &Database) -> Result<Vec<WorkItem>, DatabaseError> {
    let conn = db.conn();
    if !spool_exists(&conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare("SELECT id, work FROM work_queue ORDER BY id")?;
    let items = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    items
        .into_iter()
        .map(|(id, raw)| {
            serde_json::from_str(&raw).map_err(|e| DatabaseError::CorruptColumn {
                column: "work".into(),
                path: id.to_string(),
                detail: e.to_string(),
            })
        })
        .collect()
}

/// Drain the work queue through `executor`, deleting each item after it
/// ran. Returns the number of items executed.
pub fn run_work_queue(
    db: &Database,
    executor: &mut dyn WorkQueueExecutor,
) -> Result<usize, CoreError> {
    let items: Vec<(i64, WorkItem)> = {
        let conn = db.conn();
        if !spool_exists(&conn)? {
            return Ok(0);
        }
        let mut stmt = conn
            .prepare("SELECT id, work FROM work_queue ORDER BY id")
            .map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(DatabaseError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)?;
        rows.into_iter()
            .map(|(id, raw)| {
                serde_json::from_str(&raw)
                    .map(|item| (id, item))
                    .map_err(|e| DatabaseError::CorruptColumn {
                        column: "work".into(),
                        path: id.to_string(),
                        detail: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    info!(count = items.len(), "running work queue");
    let mut executed = 0;
    for (id, item) in items {
        debug!(id, path = item.path(), "running work item");
        executor.run(&item).map_err(DatabaseError::from)?;
        db.conn()
            .execute("DELETE FROM work_queue WHERE id = ?1", params![id])
            .map_err(DatabaseError::from)?;
        executed += 1;
    }
    Ok(executed)
}

fn spool_exists(conn: &rusqlite::Connection) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND name = 'work_queue'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
