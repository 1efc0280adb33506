//! Typed query surface over the node model, scoped to one transaction.
//!
//! [`StoreTxn`] wraps an open SQLite transaction and exposes every
//! operation the resolver needs: layer reads, conflict bookkeeping, the
//! notification and work-queue spools, move lookups, and the layer rewrite
//! primitives. Nothing here commits on its own; the owning
//! [`Database::with_txn`](super::Database::with_txn) call commits or rolls
//! back the whole batch.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::{
    Checksum, ConflictSkeleton, MovedPair, MovedTo, NodeInfo, NodeKind, NotifyAction, NotifyState,
    Presence, Props, Revision,
};
use crate::paths::{relpath_depth, relpath_dirname, relpath_join, skip_ancestor};
use crate::workqueue::WorkItem;

use super::schema::CREATE_MOVE_SPOOLS;

// Subtree clauses. `?2` is always the subtree root; the root path `''`
// matches everything.
const STRICT_DESC: &str =
    "((?2 = '' AND local_relpath <> '') OR substr(local_relpath, 1, length(?2) + 1) = ?2 || '/')";
const SELF_OR_DESC: &str = "(local_relpath = ?2 \
     OR (?2 = '' AND local_relpath <> '') \
     OR substr(local_relpath, 1, length(?2) + 1) = ?2 || '/')";

/// A row to insert into `nodes`, used by higher layers recording base
/// checkouts, copies, and moves.
#[derive(Debug, Clone, Default)]
pub struct NodeRowInsert {
    pub local_relpath: String,
    pub op_depth: i64,
    pub presence: Presence,
    pub kind: NodeKind,
    pub revision: Option<Revision>,
    pub repos_id: Option<i64>,
    pub repos_path: Option<String>,
    pub checksum: Option<Checksum>,
    pub props: Option<Props>,
    pub moved_here: bool,
    pub moved_to: Option<String>,
}

/// Transactional view of the node store.
pub struct StoreTxn<'conn> {
    tx: Transaction<'conn>,
    wc_id: i64,
    wc_root: PathBuf,
}

impl<'conn> StoreTxn<'conn> {
    pub(super) fn new(tx: Transaction<'conn>, wc_id: i64, wc_root: PathBuf) -> Self {
        Self { tx, wc_id, wc_root }
    }

    pub(super) fn commit(self) -> Result<(), rusqlite::Error> {
        self.tx.commit()
    }

    /// Raw connection access for callers outside the typed surface.
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.tx
    }

    pub fn wc_id(&self) -> i64 {
        self.wc_id
    }

    /// Absolute on-disk path for a working-copy relpath.
    pub fn abspath(&self, relpath: &str) -> PathBuf {
        if relpath.is_empty() {
            self.wc_root.clone()
        } else {
            self.wc_root.join(relpath)
        }
    }

    pub fn wc_root(&self) -> &Path {
        &self.wc_root
    }

    /// Create the per-transaction notification and work-queue spools.
    pub fn create_move_spools(&self) -> Result<(), DatabaseError> {
        self.tx.execute_batch(CREATE_MOVE_SPOOLS)?;
        Ok(())
    }

    /// Fail with `NotLocked` unless a write lock covers `relpath`.
    pub fn verify_write_lock(&self, relpath: &str) -> Result<(), DatabaseError> {
        if super::lock_covers(&self.tx, self.wc_id, relpath)? {
            Ok(())
        } else {
            Err(DatabaseError::NotLocked(relpath.to_string()))
        }
    }

    // -----------------------------------------------------------------------
    // Layer reads
    // -----------------------------------------------------------------------

    /// Read the `nodes` row for `relpath` at exactly `op_depth`.
    pub fn depth_get_info(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<Option<NodeInfo>, DatabaseError> {
        let row = self
            .tx
            .query_row(
                "SELECT presence, kind, revision, repos_id, repos_path, checksum,
                        properties, moved_to, moved_here
                 FROM nodes WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth = ?3",
                params![self.wc_id, relpath, op_depth],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, bool>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((presence, kind, revision, repos_id, repos_path, checksum, props, moved_to, moved_here)) =
            row
        else {
            return Ok(None);
        };

        let props = match props {
            Some(raw) => Some(parse_props(&raw, relpath)?),
            None => None,
        };

        Ok(Some(NodeInfo {
            presence: Presence::from_str_val(&presence),
            kind: NodeKind::from_str_val(&kind),
            revision,
            repos_id,
            repos_path,
            checksum: checksum.map(Checksum),
            props,
            moved_to,
            moved_here,
        }))
    }

    /// Sorted base names of the children of `relpath` at `op_depth`.
    pub fn get_children(&self, relpath: &str, op_depth: i64) -> Result<Vec<String>, DatabaseError> {
        let mut stmt = self.tx.prepare(
            "SELECT local_relpath FROM nodes
             WHERE wc_id = ?1 AND parent_relpath = ?2 AND op_depth = ?3
             ORDER BY local_relpath",
        )?;
        let children = stmt
            .query_map(params![self.wc_id, relpath, op_depth], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(children
            .into_iter()
            .map(|p| crate::paths::relpath_basename(&p).to_string())
            .collect())
    }

    /// All rows strictly under `relpath` at `op_depth`, deepest paths first.
    pub fn descendants_at_op_depth(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<Vec<(String, NodeKind)>, DatabaseError> {
        let sql = format!(
            "SELECT local_relpath, kind FROM nodes
             WHERE wc_id = ?1 AND {STRICT_DESC} AND op_depth = ?3
             ORDER BY local_relpath DESC"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath, op_depth], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(p, k)| (p, NodeKind::from_str_val(&k)))
            .collect())
    }

    /// All rows of the layer rooted at `relpath` at `op_depth`, root first.
    pub fn layer_rows(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<Vec<(String, NodeKind)>, DatabaseError> {
        let sql = format!(
            "SELECT local_relpath, kind FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = ?3
             ORDER BY local_relpath"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath, op_depth], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(p, k)| (p, NodeKind::from_str_val(&k)))
            .collect())
    }

    /// Highest working (op_depth > 0) layer at `relpath`.
    pub fn highest_working_op_depth(&self, relpath: &str) -> Result<Option<i64>, DatabaseError> {
        let depth = self
            .tx
            .query_row(
                "SELECT op_depth FROM nodes
                 WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth > 0
                 ORDER BY op_depth DESC LIMIT 1",
                params![self.wc_id, relpath],
                |row| row.get(0),
            )
            .optional()?;
        Ok(depth)
    }

    /// Lowest layer at `relpath` strictly above `above_op_depth`.
    pub fn lowest_op_depth_above(
        &self,
        relpath: &str,
        above_op_depth: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let depth = self
            .tx
            .query_row(
                "SELECT op_depth FROM nodes
                 WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth > ?3
                 ORDER BY op_depth ASC LIMIT 1",
                params![self.wc_id, relpath, above_op_depth],
                |row| row.get(0),
            )
            .optional()?;
        Ok(depth)
    }

    /// Highest layer at `relpath` strictly below `below_op_depth`.
    pub fn highest_op_depth_below(
        &self,
        relpath: &str,
        below_op_depth: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let depth = self
            .tx
            .query_row(
                "SELECT op_depth FROM nodes
                 WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth < ?3
                 ORDER BY op_depth DESC LIMIT 1",
                params![self.wc_id, relpath, below_op_depth],
                |row| row.get(0),
            )
            .optional()?;
        Ok(depth)
    }

    /// Rows of every layer strictly above `op_depth` in the subtree at
    /// `relpath`: `(local_relpath, op_depth, presence)`.
    pub fn working_layers_above(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<Vec<(String, i64, Presence)>, DatabaseError> {
        let sql = format!(
            "SELECT local_relpath, op_depth, presence FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth > ?3
             ORDER BY local_relpath, op_depth"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath, op_depth], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(p, d, presence)| (p, d, Presence::from_str_val(&presence)))
            .collect())
    }

    /// True when a layer exists at `relpath` with
    /// `below_op_depth < op_depth < above_op_depth`.
    pub fn has_layer_between(
        &self,
        relpath: &str,
        below_op_depth: i64,
        above_op_depth: i64,
    ) -> Result<bool, DatabaseError> {
        let row: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM nodes
                 WHERE wc_id = ?1 AND local_relpath = ?2
                   AND op_depth > ?3 AND op_depth < ?4
                 LIMIT 1",
                params![self.wc_id, relpath, below_op_depth, above_op_depth],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    // -----------------------------------------------------------------------
    // Depth checks for bumping
    // -----------------------------------------------------------------------

    /// True when `relpath` has real children at `op_depth`.
    pub fn op_depth_children_exist(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<bool, DatabaseError> {
        let row: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM nodes
                 WHERE wc_id = ?1 AND parent_relpath = ?2 AND op_depth = ?3
                   AND presence NOT IN ('base-deleted', 'not-present')
                 LIMIT 1",
                params![self.wc_id, relpath, op_depth],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// True when `relpath` has a non-file child at `op_depth`.
    pub fn has_non_file_children(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<bool, DatabaseError> {
        let row: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM nodes
                 WHERE wc_id = ?1 AND parent_relpath = ?2 AND op_depth = ?3
                   AND kind <> 'file'
                   AND presence NOT IN ('base-deleted', 'not-present')
                 LIMIT 1",
                params![self.wc_id, relpath, op_depth],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// True when `relpath` has descendants deeper than its immediate
    /// children at `op_depth`.
    pub fn has_grandchildren(&self, relpath: &str, op_depth: i64) -> Result<bool, DatabaseError> {
        let sql = format!(
            "SELECT 1 FROM nodes
             WHERE wc_id = ?1 AND {STRICT_DESC} AND op_depth = ?3
               AND substr(local_relpath, length(?2) + 2) LIKE '%/%'
             LIMIT 1"
        );
        let row: Option<i64> = self
            .tx
            .query_row(&sql, params![self.wc_id, relpath, op_depth], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(row.is_some())
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    /// Find the move whose source covers `relpath` at an op-depth strictly
    /// greater than `above_op_depth`.
    ///
    /// Climbs from `relpath` towards the root looking for a recorded
    /// moved-to linkage and maps `relpath` through it.
    pub fn op_depth_moved_to(
        &self,
        relpath: &str,
        above_op_depth: i64,
    ) -> Result<Option<MovedTo>, DatabaseError> {
        let mut probe = relpath.to_string();
        loop {
            let row: Option<(i64, String)> = self
                .tx
                .query_row(
                    "SELECT op_depth, moved_to FROM nodes
                     WHERE wc_id = ?1 AND local_relpath = ?2
                       AND op_depth > ?3 AND moved_to IS NOT NULL
                     ORDER BY op_depth ASC LIMIT 1",
                    params![self.wc_id, probe, above_op_depth],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((op_depth, moved_to)) = row {
                let suffix = skip_ancestor(&probe, relpath).unwrap_or("");
                let mut src_op_root = probe.clone();
                while relpath_depth(&src_op_root) > op_depth {
                    src_op_root = relpath_dirname(&src_op_root).to_string();
                }
                return Ok(Some(MovedTo {
                    dst_relpath: relpath_join(&moved_to, suffix),
                    dst_op_root: moved_to,
                    src_root: probe,
                    src_op_root,
                }));
            }

            if probe.is_empty() {
                return Ok(None);
            }
            probe = relpath_dirname(&probe).to_string();
        }
    }

    /// All moves whose source is at or under `relpath`, recorded at an
    /// op-depth strictly greater than `above_op_depth`.
    pub fn moved_pairs(
        &self,
        relpath: &str,
        above_op_depth: i64,
    ) -> Result<Vec<MovedPair>, DatabaseError> {
        let sql = format!(
            "SELECT local_relpath, moved_to, op_depth, kind FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC}
               AND op_depth > ?3 AND moved_to IS NOT NULL
             ORDER BY local_relpath"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath, above_op_depth], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(src, dst, op_depth, kind)| MovedPair {
                src_relpath: src,
                dst_relpath: dst,
                src_op_depth: op_depth,
                kind: NodeKind::from_str_val(&kind),
            })
            .collect())
    }

    /// Moves recorded at or under `relpath` at `op_depth` or deeper.
    pub fn moved_descendants(
        &self,
        relpath: &str,
        min_op_depth: i64,
    ) -> Result<Vec<(String, String, i64)>, DatabaseError> {
        let sql = format!(
            "SELECT local_relpath, moved_to, op_depth FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC}
               AND op_depth >= ?3 AND moved_to IS NOT NULL
             ORDER BY local_relpath"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath, min_op_depth], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Destinations of every move out of the subtree at `relpath`.
    pub fn moved_outside(&self, relpath: &str) -> Result<Vec<String>, DatabaseError> {
        let sql = format!(
            "SELECT moved_to FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC}
               AND op_depth > 0 AND moved_to IS NOT NULL
             ORDER BY local_relpath"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record or clear the moved-to linkage on a source op-root row.
    pub fn set_moved_to(
        &self,
        relpath: &str,
        op_depth: i64,
        moved_to: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.tx.execute(
            "UPDATE nodes SET moved_to = ?4
             WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth = ?3",
            params![self.wc_id, relpath, op_depth, moved_to],
        )?;
        Ok(())
    }

    /// Flip the moved-here flag on the layer rooted at `relpath`.
    pub fn set_moved_here_recursive(
        &self,
        relpath: &str,
        op_depth: i64,
        moved_here: bool,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "UPDATE nodes SET moved_here = ?4
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = ?3"
        );
        self.tx
            .execute(&sql, params![self.wc_id, relpath, op_depth, moved_here])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conflict storage
    // -----------------------------------------------------------------------

    /// Read the conflict skeleton recorded on `relpath`, if any.
    pub fn read_conflict(&self, relpath: &str) -> Result<Option<ConflictSkeleton>, DatabaseError> {
        let raw: Option<Option<String>> = self
            .tx
            .query_row(
                "SELECT conflict_data FROM actual WHERE wc_id = ?1 AND local_relpath = ?2",
                params![self.wc_id, relpath],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DatabaseError::CorruptColumn {
                    column: "conflict_data".into(),
                    path: relpath.to_string(),
                    detail: e.to_string(),
                }),
        }
    }

    /// Persist `skeleton` as the conflict on `relpath`.
    ///
    /// Re-marking with an equal skeleton is a no-op. Extending a recorded
    /// text/property conflict (or refreshing one whose tree conflict is
    /// unchanged) overwrites. Any attempt to replace a recorded tree
    /// conflict with a different one fails with `ObstructedUpdate`.
    pub fn mark_conflict(
        &self,
        relpath: &str,
        skeleton: &ConflictSkeleton,
    ) -> Result<(), DatabaseError> {
        self.verify_write_lock(relpath)?;

        if let Some(existing) = self.read_conflict(relpath)? {
            if existing == *skeleton {
                debug!(path = relpath, "conflict already recorded, skipping");
                return Ok(());
            }
            if existing.tree.is_some() && existing.tree != skeleton.tree {
                return Err(DatabaseError::ObstructedUpdate(relpath.to_string()));
            }
        }

        let json = serde_json::to_string(skeleton).expect("conflict skeleton serializes");
        let now = Utc::now().to_rfc3339();
        self.tx.execute(
            "INSERT INTO actual (wc_id, local_relpath, conflict_data, conflict_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(wc_id, local_relpath)
             DO UPDATE SET conflict_data = excluded.conflict_data,
                           conflict_at = excluded.conflict_at",
            params![self.wc_id, relpath, json, now],
        )?;
        debug!(path = relpath, "recorded conflict");
        Ok(())
    }

    /// Remove the conflict recorded on `relpath` (an explicit resolve).
    pub fn clear_conflict(&self, relpath: &str) -> Result<(), DatabaseError> {
        self.verify_write_lock(relpath)?;
        self.tx.execute(
            "UPDATE actual SET conflict_data = NULL, conflict_at = NULL
             WHERE wc_id = ?1 AND local_relpath = ?2",
            params![self.wc_id, relpath],
        )?;
        self.prune_actual(relpath)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Actual (working) properties
    // -----------------------------------------------------------------------

    /// Working property overrides recorded on `relpath`.
    pub fn read_actual_props(&self, relpath: &str) -> Result<Option<Props>, DatabaseError> {
        let raw: Option<Option<String>> = self
            .tx
            .query_row(
                "SELECT properties FROM actual WHERE wc_id = ?1 AND local_relpath = ?2",
                params![self.wc_id, relpath],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            None => Ok(None),
            Some(json) => parse_props(&json, relpath).map(Some),
        }
    }

    /// Write (or clear) the working properties of `relpath`. Passing `None`
    /// clears the override, meaning the node-layer properties apply.
    pub fn set_actual_props(
        &self,
        relpath: &str,
        props: Option<&Props>,
    ) -> Result<(), DatabaseError> {
        self.verify_write_lock(relpath)?;
        let json = props.map(|p| serde_json::to_string(p).expect("props serialize"));
        self.tx.execute(
            "INSERT INTO actual (wc_id, local_relpath, properties) VALUES (?1, ?2, ?3)
             ON CONFLICT(wc_id, local_relpath)
             DO UPDATE SET properties = excluded.properties",
            params![self.wc_id, relpath, json],
        )?;
        self.prune_actual(relpath)?;
        Ok(())
    }

    /// Drop an `actual` row that no longer carries any override.
    fn prune_actual(&self, relpath: &str) -> Result<(), DatabaseError> {
        self.tx.execute(
            "DELETE FROM actual
             WHERE wc_id = ?1 AND local_relpath = ?2
               AND properties IS NULL AND conflict_data IS NULL",
            params![self.wc_id, relpath],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Spools
    // -----------------------------------------------------------------------

    /// Append a work item to the work-queue spool.
    pub fn wq_add(&self, item: &WorkItem) -> Result<i64, DatabaseError> {
        let json = serde_json::to_string(item).expect("work item serializes");
        let now = Utc::now().to_rfc3339();
        self.tx.execute(
            "INSERT INTO work_queue (work, created_at) VALUES (?1, ?2)",
            params![json, now],
        )?;
        let id = self.tx.last_insert_rowid();
        debug!(id, path = item.path(), "spooled work item");
        Ok(id)
    }

    /// Append a record to the notification spool.
    pub fn notify_add(
        &self,
        relpath: &str,
        action: NotifyAction,
        kind: NodeKind,
        content_state: NotifyState,
        prop_state: NotifyState,
    ) -> Result<(), DatabaseError> {
        self.tx.execute(
            "INSERT INTO update_move_list
             (local_relpath, action, kind, content_state, prop_state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                relpath,
                action.to_string(),
                kind.to_string(),
                content_state.to_string(),
                prop_state.to_string()
            ],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node row maintenance
    // -----------------------------------------------------------------------

    /// Insert (or replace) one `nodes` row.
    pub fn insert_node(&self, row: &NodeRowInsert) -> Result<(), DatabaseError> {
        let parent: Option<&str> = if row.local_relpath.is_empty() {
            None
        } else {
            Some(relpath_dirname(&row.local_relpath))
        };
        let props = row
            .props
            .as_ref()
            .map(|p| serde_json::to_string(p).expect("props serialize"));
        self.tx.execute(
            "INSERT OR REPLACE INTO nodes
             (wc_id, local_relpath, op_depth, parent_relpath, repos_id, repos_path,
              revision, presence, kind, checksum, properties, moved_here, moved_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                self.wc_id,
                row.local_relpath,
                row.op_depth,
                parent,
                row.repos_id,
                row.repos_path,
                row.revision,
                row.presence.to_string(),
                row.kind.to_string(),
                row.checksum.as_ref().map(|c| c.as_str()),
                props,
                row.moved_here,
                row.moved_to,
            ],
        )?;
        Ok(())
    }

    /// Install a base-deleted shadow for `relpath` when a delete layer on
    /// its parent above `op_depth` would otherwise not cover it.
    pub fn extend_parent_delete(
        &self,
        relpath: &str,
        kind: NodeKind,
        op_depth: i64,
    ) -> Result<(), DatabaseError> {
        let parent = relpath_dirname(relpath);
        let Some(parent_op_depth) = self.lowest_op_depth_above(parent, op_depth)? else {
            return Ok(());
        };
        let existing = self.lowest_op_depth_above(relpath, op_depth)?;
        if existing.map_or(true, |e| parent_op_depth < e) {
            debug!(path = relpath, parent_op_depth, "extending parent delete");
            self.tx.execute(
                "INSERT OR REPLACE INTO nodes
                 (wc_id, local_relpath, op_depth, parent_relpath, presence, kind)
                 VALUES (?1, ?2, ?3, ?4, 'base-deleted', ?5)",
                params![self.wc_id, relpath, parent_op_depth, parent, kind.to_string()],
            )?;
        }
        Ok(())
    }

    /// Remove the base-deleted shadow installed directly above `op_depth`.
    pub fn retract_parent_delete(&self, relpath: &str, op_depth: i64) -> Result<(), DatabaseError> {
        self.tx.execute(
            "DELETE FROM nodes
             WHERE wc_id = ?1 AND local_relpath = ?2 AND presence = 'base-deleted'
               AND op_depth = (SELECT MIN(op_depth) FROM nodes
                               WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth > ?3)",
            params![self.wc_id, relpath, op_depth],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Layer rewrite primitives (used by the layer replacer)
    // -----------------------------------------------------------------------

    /// Copy the row at `(src, src_op_depth)` to `(dst, dst_op_depth)`,
    /// flagging it moved-here and preserving any moved-to linkage already
    /// recorded at the destination.
    pub fn copy_node_move(
        &self,
        src: &str,
        src_op_depth: i64,
        dst: &str,
        dst_op_depth: i64,
        dst_parent: &str,
    ) -> Result<(), DatabaseError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO nodes
             (wc_id, local_relpath, op_depth, parent_relpath, repos_id, repos_path,
              revision, presence, kind, checksum, properties, moved_here, moved_to)
             SELECT wc_id, ?4, ?5, ?6, repos_id, repos_path, revision, presence, kind,
                    checksum, properties, 1,
                    (SELECT moved_to FROM nodes
                     WHERE wc_id = ?1 AND local_relpath = ?4 AND op_depth = ?5)
             FROM nodes WHERE wc_id = ?1 AND local_relpath = ?2 AND op_depth = ?3",
            params![self.wc_id, src, src_op_depth, dst, dst_op_depth, dst_parent],
        )?;
        Ok(())
    }

    /// Delete rows of the layer at `op_depth` under `relpath` that do not
    /// shadow a row at `op_depth_below`.
    pub fn delete_no_lower_layer(
        &self,
        relpath: &str,
        op_depth: i64,
        op_depth_below: i64,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "DELETE FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = ?3
               AND NOT EXISTS (SELECT 1 FROM nodes n
                               WHERE n.wc_id = ?1
                                 AND n.local_relpath = nodes.local_relpath
                                 AND n.op_depth = ?4)"
        );
        self.tx
            .execute(&sql, params![self.wc_id, relpath, op_depth, op_depth_below])?;
        Ok(())
    }

    /// Convert remaining rows of the layer at `op_depth` under `relpath`
    /// into bare base-deleted shadows.
    pub fn replace_with_base_deleted(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "UPDATE nodes
             SET presence = 'base-deleted', repos_id = NULL, repos_path = NULL,
                 revision = NULL, checksum = NULL, properties = NULL, moved_here = 0
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = ?3"
        );
        self.tx
            .execute(&sql, params![self.wc_id, relpath, op_depth])?;
        Ok(())
    }

    /// Drop the whole layer at `op_depth` under `relpath`.
    pub fn delete_working_op_depth(&self, relpath: &str, op_depth: i64) -> Result<(), DatabaseError> {
        let sql = format!(
            "DELETE FROM nodes WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = ?3"
        );
        self.tx
            .execute(&sql, params![self.wc_id, relpath, op_depth])?;
        Ok(())
    }

    /// Drop every layer strictly above `op_depth` under `relpath`.
    pub fn delete_working_op_depth_above(
        &self,
        relpath: &str,
        op_depth: i64,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "DELETE FROM nodes WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth > ?3"
        );
        self.tx
            .execute(&sql, params![self.wc_id, relpath, op_depth])?;
        Ok(())
    }

    /// Move the layer under `relpath` from one op-depth to another,
    /// clearing the moved-here flag (the layer becomes a plain copy).
    pub fn update_op_depth_recursive(
        &self,
        relpath: &str,
        from_op_depth: i64,
        to_op_depth: i64,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "UPDATE nodes SET op_depth = ?4, moved_here = 0
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = ?3"
        );
        self.tx.execute(
            &sql,
            params![self.wc_id, relpath, from_op_depth, to_op_depth],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Repository info
    // -----------------------------------------------------------------------

    /// Root URL and UUID of a registered repository.
    pub fn fetch_repos_info(&self, repos_id: i64) -> Result<(String, String), DatabaseError> {
        self.tx
            .query_row(
                "SELECT root_url, uuid FROM repositories WHERE id = ?1",
                params![repos_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "repository".into(),
                path: repos_id.to_string(),
            })
    }

    /// Base-layer repository locations of the subtree at `relpath`:
    /// `(local_relpath, repos_path, revision)` per row.
    pub fn base_subtree_locations(
        &self,
        relpath: &str,
    ) -> Result<Vec<(String, Option<String>, Option<Revision>)>, DatabaseError> {
        let sql = format!(
            "SELECT local_relpath, repos_path, revision FROM nodes
             WHERE wc_id = ?1 AND {SELF_OR_DESC} AND op_depth = 0
             ORDER BY local_relpath"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.wc_id, relpath], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_props(raw: &str, relpath: &str) -> Result<Props, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::CorruptColumn {
        column: "properties".into(),
        path: relpath.to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictAction, ConflictReason, Operation, TreeConflictInfo};

    fn setup_db() -> Database {
        let db = Database::in_memory("/wc").unwrap();
        db.initialize().unwrap();
        db
    }

    fn node(relpath: &str, op_depth: i64, kind: NodeKind) -> NodeRowInsert {
        NodeRowInsert {
            local_relpath: relpath.to_string(),
            op_depth,
            kind,
            presence: Presence::Normal,
            ..Default::default()
        }
    }

    fn tree_skel(reason: ConflictReason) -> ConflictSkeleton {
        ConflictSkeleton {
            operation: Some(Operation::Update),
            tree: Some(TreeConflictInfo {
                reason,
                action: ConflictAction::Edit,
                move_src_op_root: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_depth_get_info_and_children() {
        let db = setup_db();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            txn.insert_node(&node("a", 0, NodeKind::Dir))?;
            txn.insert_node(&node("a/x", 0, NodeKind::File))?;
            txn.insert_node(&node("a/m", 0, NodeKind::Dir))?;

            let info = txn.depth_get_info("a", 0)?.unwrap();
            assert_eq!(info.kind, NodeKind::Dir);
            assert_eq!(info.presence, Presence::Normal);
            assert!(txn.depth_get_info("a", 1)?.is_none());
            assert!(txn.depth_get_info("missing", 0)?.is_none());

            assert_eq!(txn.get_children("a", 0)?, vec!["m", "x"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_subtree_clause_handles_root() {
        let db = setup_db();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            txn.insert_node(&node("", 0, NodeKind::Dir))?;
            txn.insert_node(&node("a", 0, NodeKind::Dir))?;
            txn.insert_node(&node("a/b", 0, NodeKind::File))?;

            let rows = txn.layer_rows("", 0)?;
            assert_eq!(rows.len(), 3);
            let rows = txn.descendants_at_op_depth("", 0)?;
            assert_eq!(rows.len(), 2);
            // Deepest first.
            assert_eq!(rows[0].0, "a/b");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_mark_conflict_idempotent_and_obstructed() {
        let db = setup_db();
        db.acquire_write_lock("").unwrap();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            let skel = tree_skel(ConflictReason::MovedAway);
            txn.mark_conflict("a", &skel)?;
            // Equivalent re-mark is a no-op.
            txn.mark_conflict("a", &skel)?;
            assert_eq!(txn.read_conflict("a")?.unwrap(), skel);

            // A different tree conflict is an obstruction.
            let other = tree_skel(ConflictReason::Deleted);
            let err = txn.mark_conflict("a", &other).unwrap_err();
            assert!(matches!(err, DatabaseError::ObstructedUpdate(_)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_mark_conflict_requires_lock() {
        let db = setup_db();
        let result: Result<(), DatabaseError> = db.with_txn(|txn| {
            txn.mark_conflict("a", &tree_skel(ConflictReason::Edited))
        });
        assert!(matches!(result, Err(DatabaseError::NotLocked(_))));
    }

    #[test]
    fn test_actual_props_roundtrip_and_prune() {
        let db = setup_db();
        db.acquire_write_lock("").unwrap();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            let props: Props = [("k".to_string(), "v".to_string())].into();
            txn.set_actual_props("a/f", Some(&props))?;
            assert_eq!(txn.read_actual_props("a/f")?.unwrap(), props);

            // Clearing removes the row entirely.
            txn.set_actual_props("a/f", None)?;
            assert!(txn.read_actual_props("a/f")?.is_none());
            let count: i64 = txn.raw().query_row(
                "SELECT COUNT(*) FROM actual",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_op_depth_moved_to_climbs() {
        let db = setup_db();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            // Move a/b -> x recorded at the source op-root a/b (depth 2).
            let mut row = node("a/b", 2, NodeKind::Dir);
            row.presence = Presence::BaseDeleted;
            row.moved_to = Some("x".to_string());
            txn.insert_node(&row)?;

            let moved = txn.op_depth_moved_to("a/b/c", 1)?.unwrap();
            assert_eq!(moved.dst_relpath, "x/c");
            assert_eq!(moved.dst_op_root, "x");
            assert_eq!(moved.src_root, "a/b");
            assert_eq!(moved.src_op_root, "a/b");

            // Nothing above op-depth 2.
            assert!(txn.op_depth_moved_to("a/b/c", 2)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_extend_and_retract_parent_delete() {
        let db = setup_db();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            // b (depth 1) has a delete layer at op-depth 2 on child b/c.
            txn.insert_node(&node("b", 1, NodeKind::Dir))?;
            let mut del = node("b/c", 2, NodeKind::Dir);
            del.presence = Presence::BaseDeleted;
            txn.insert_node(&del)?;

            // Installing b/c/new at op-depth 1 must extend the delete.
            txn.insert_node(&node("b/c/new", 1, NodeKind::File))?;
            txn.extend_parent_delete("b/c/new", NodeKind::File, 1)?;
            let shadow = txn.depth_get_info("b/c/new", 2)?.unwrap();
            assert_eq!(shadow.presence, Presence::BaseDeleted);

            txn.retract_parent_delete("b/c/new", 1)?;
            assert!(txn.depth_get_info("b/c/new", 2)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_copy_node_move_preserves_dst_moved_to() {
        let db = setup_db();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            let mut src = node("a/f", 0, NodeKind::File);
            src.checksum = Some(Checksum::of_bytes(b"new"));
            src.revision = Some(5);
            txn.insert_node(&src)?;

            // Destination row carries a nested move linkage that must survive.
            let mut dst = node("b/f", 1, NodeKind::File);
            dst.moved_to = Some("elsewhere".to_string());
            txn.insert_node(&dst)?;

            txn.copy_node_move("a/f", 0, "b/f", 1, "b")?;
            let copied = txn.depth_get_info("b/f", 1)?.unwrap();
            assert_eq!(copied.checksum, Some(Checksum::of_bytes(b"new")));
            assert_eq!(copied.revision, Some(5));
            assert!(copied.moved_here);
            assert_eq!(copied.moved_to.as_deref(), Some("elsewhere"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_layer_rewrite_primitives() {
        let db = setup_db();
        db.with_txn::<_, DatabaseError, _>(|txn| {
            txn.insert_node(&node("b", 1, NodeKind::Dir))?;
            txn.insert_node(&node("b/f", 1, NodeKind::File))?;
            txn.insert_node(&node("b/f", 3, NodeKind::File))?;

            // b/f shadows an op-depth-3 row: replaced, not deleted.
            txn.delete_no_lower_layer("b", 1, 3)?;
            assert!(txn.depth_get_info("b", 1)?.is_none());
            assert!(txn.depth_get_info("b/f", 1)?.is_some());

            txn.replace_with_base_deleted("b/f", 1)?;
            let row = txn.depth_get_info("b/f", 1)?.unwrap();
            assert_eq!(row.presence, Presence::BaseDeleted);
            assert!(row.checksum.is_none());

            txn.update_op_depth_recursive("b/f", 3, 2)?;
            assert!(txn.depth_get_info("b/f", 3)?.is_none());
            assert!(txn.depth_get_info("b/f", 2)?.is_some());

            txn.delete_working_op_depth_above("b", 0)?;
            assert!(txn.depth_get_info("b/f", 2)?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
