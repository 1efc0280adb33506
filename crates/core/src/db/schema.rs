//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[(
    1,
    "initial schema",
    r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        local_root  TEXT    NOT NULL UNIQUE,
        uuid        TEXT    NOT NULL,
        created_at  TEXT    NOT NULL
    );

    CREATE TABLE IF NOT EXISTS repositories (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        root_url    TEXT    NOT NULL UNIQUE,
        uuid        TEXT    NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        wc_id           INTEGER NOT NULL,
        local_relpath   TEXT    NOT NULL,
        op_depth        INTEGER NOT NULL,
        parent_relpath  TEXT,
        repos_id        INTEGER REFERENCES repositories (id),
        repos_path      TEXT,
        revision        INTEGER,
        presence        TEXT    NOT NULL DEFAULT 'normal',
        kind            TEXT    NOT NULL,
        checksum        TEXT,
        properties      TEXT,
        moved_here      INTEGER NOT NULL DEFAULT 0,
        moved_to        TEXT,
        PRIMARY KEY (wc_id, local_relpath, op_depth)
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_parent
        ON nodes (wc_id, parent_relpath, op_depth);
    CREATE INDEX IF NOT EXISTS idx_nodes_moved_to
        ON nodes (wc_id, moved_to) WHERE moved_to IS NOT NULL;

    CREATE TABLE IF NOT EXISTS actual (
        wc_id           INTEGER NOT NULL,
        local_relpath   TEXT    NOT NULL,
        properties      TEXT,
        conflict_data   TEXT,
        conflict_at     TEXT,
        PRIMARY KEY (wc_id, local_relpath)
    );

    CREATE TABLE IF NOT EXISTS wc_locks (
        wc_id           INTEGER NOT NULL,
        local_relpath   TEXT    NOT NULL,
        locked_at       TEXT    NOT NULL,
        PRIMARY KEY (wc_id, local_relpath)
    );
    "#,
)];

/// SQL creating the per-transaction notification and work-queue spools.
///
/// Temporary tables are connection-local: rows inserted inside an aborted
/// transaction vanish with the rollback, rows from a committed transaction
/// stay visible for post-commit draining on the same connection.
pub const CREATE_MOVE_SPOOLS: &str = r#"
    CREATE TEMPORARY TABLE IF NOT EXISTS update_move_list (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        local_relpath   TEXT NOT NULL,
        action          TEXT NOT NULL,
        kind            TEXT NOT NULL,
        content_state   TEXT NOT NULL,
        prop_state      TEXT NOT NULL
    );

    CREATE TEMPORARY TABLE IF NOT EXISTS work_queue (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        work            TEXT NOT NULL,
        created_at      TEXT NOT NULL
    );
"#;

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        assert!(tables.contains(&"workspaces".to_string()));
        assert!(tables.contains(&"repositories".to_string()));
        assert!(tables.contains(&"nodes".to_string()));
        assert!(tables.contains(&"actual".to_string()));
        assert!(tables.contains(&"wc_locks".to_string()));
    }

    #[test]
    fn test_spool_tables_are_temporary() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch(CREATE_MOVE_SPOOLS).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
