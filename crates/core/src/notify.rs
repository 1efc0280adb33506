//! Post-commit notification delivery.
//!
//! Notifications raised while the resolver runs are spooled into the
//! temporary `update_move_list` table inside the resolution transaction.
//! After the transaction commits they are drained here, in insertion order,
//! and the spool is finalized. An aborted transaction leaves nothing to
//! drain.

use rusqlite::params;
use tracing::{debug, info};

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{NodeKind, Notification, NotifyAction, NotifyState, Revision};

/// Sink receiving one call per spooled notification record.
pub trait NotifySink {
    fn notify(&mut self, notification: &Notification);
}

impl<F> NotifySink for F
where
    F: FnMut(&Notification),
{
    fn notify(&mut self, notification: &Notification) {
        self(notification)
    }
}

/// A sink that collects notifications into a `Vec`, for tests and callers
/// that want to inspect the batch.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub notifications: Vec<Notification>,
}

impl NotifySink for CollectingSink {
    fn notify(&mut self, notification: &Notification) {
        self.notifications.push(notification.clone());
    }
}

/// Reborrow an `Option<&mut dyn NotifySink>` for a single call without
/// consuming the original binding.
pub fn reborrow_sink<'a>(
    sink: &'a mut Option<&mut dyn NotifySink>,
) -> Option<&'a mut dyn NotifySink> {
    match sink {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

/// Send all spooled notifications to `sink` and clear the spool.
///
/// `old_revision` / `new_revision` are stamped onto every record, matching
/// the update that triggered the resolution. The spool is cleared even when
/// no sink is given. Returns the number of records drained.
pub fn drain_move_notifications(
    db: &Database,
    old_revision: Option<Revision>,
    new_revision: Option<Revision>,
    mut sink: Option<&mut dyn NotifySink>,
) -> Result<usize, DatabaseError> {
    let records: Vec<Notification> = {
        let conn = db.conn();
        if !spool_exists(&conn)? {
            return Ok(0);
        }
        let mut stmt = conn.prepare(
            "SELECT local_relpath, action, kind, content_state, prop_state
             FROM update_move_list ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(path, action, kind, content, prop)| Notification {
                path,
                action: NotifyAction::from_str_val(&action),
                kind: NodeKind::from_str_val(&kind),
                content_state: NotifyState::from_str_val(&content),
                prop_state: NotifyState::from_str_val(&prop),
                old_revision,
                new_revision,
            })
            .collect()
    };

    if let Some(sink) = sink.as_deref_mut() {
        for record in &records {
            debug!(path = %record.path, action = %record.action, "notifying");
            sink.notify(record);
        }
    }

    db.conn()
        .execute("DELETE FROM update_move_list", params![])?;
    info!(count = records.len(), "drained move notifications");
    Ok(records.len())
}

fn spool_exists(conn: &rusqlite::Connection) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND name = 'update_move_list'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::CREATE_MOVE_SPOOLS;

    #[test]
    fn test_drain_without_spool_is_empty() {
        let db = Database::in_memory("/wc").unwrap();
        db.initialize().unwrap();
        let mut sink = CollectingSink::default();
        let n = drain_move_notifications(&db, None, None, Some(&mut sink)).unwrap();
        assert_eq!(n, 0);
        assert!(sink.notifications.is_empty());
    }

    #[test]
    fn test_drain_in_insertion_order_and_finalize() {
        let db = Database::in_memory("/wc").unwrap();
        db.initialize().unwrap();
        {
            let conn = db.conn();
            conn.execute_batch(CREATE_MOVE_SPOOLS).unwrap();
            for path in ["b", "b/f", "b/g"] {
                conn.execute(
                    "INSERT INTO update_move_list
                     (local_relpath, action, kind, content_state, prop_state)
                     VALUES (?1, 'update_update', 'file', 'changed', 'unchanged')",
                    params![path],
                )
                .unwrap();
            }
        }

        let mut sink = CollectingSink::default();
        let n = drain_move_notifications(&db, Some(4), Some(5), Some(&mut sink)).unwrap();
        assert_eq!(n, 3);
        let paths: Vec<&str> = sink.notifications.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "b/f", "b/g"]);
        assert_eq!(sink.notifications[0].old_revision, Some(4));
        assert_eq!(sink.notifications[0].new_revision, Some(5));

        // Second drain finds a cleared spool.
        let n = drain_move_notifications(&db, Some(4), Some(5), None).unwrap();
        assert_eq!(n, 0);
    }
}
