//! Error types for the wcsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite node-store layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A mutation was attempted without a verified write-lock on the
    /// relevant op-root.
    #[error("no write-lock in '{0}'")]
    NotLocked(String),

    /// Attempted to record a second, incompatible tree conflict on a node.
    #[error("'{0}' is already in conflict")]
    ObstructedUpdate(String),

    /// A required row was not found.
    #[error("{entity} not found: {path}")]
    NotFound {
        entity: String,
        path: String,
    },

    /// A persisted JSON column failed to deserialize.
    #[error("corrupt {column} column at '{path}': {detail}")]
    CorruptColumn {
        column: String,
        path: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Resolver errors
// ---------------------------------------------------------------------------

/// Errors from the update-move conflict resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The victim carries no tree conflict to resolve.
    #[error("'{0}' is not in conflict")]
    NotInConflict(String),

    /// The recorded conflict was produced by an operation other than
    /// update or switch.
    #[error("cannot auto-resolve tree conflict on '{0}'")]
    UnsupportedConflict(String),

    /// The victim has no recorded move destination.
    #[error("the node '{0}' has not been moved away")]
    NotMovedAway(String),

    /// The move source spans more than one revision.
    #[error("cannot apply update because move source '{0}' is a mixed-revision working copy")]
    MixedRevisionSource(String),

    /// The move source is under a switched URL.
    #[error("cannot apply update because move source '{0}' is a switched subtree")]
    SwitchedSubtree(String),

    /// Any other invariant violation: wrong op-depth, inconsistent kinds,
    /// malformed skeleton.
    #[error("resolver failure on '{path}': {detail}")]
    ResolverFailure {
        path: String,
        detail: String,
    },

    /// The cancellation callback signaled.
    #[error("operation cancelled")]
    Cancelled,

    /// Store error during resolution.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// File-merger error during resolution.
    #[error(transparent)]
    Merge(#[from] MergeError),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the file-content merger and pristine store.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A pristine checksum could not be resolved to a local path.
    #[error("pristine not found for checksum {0}")]
    PristineNotFound(String),

    /// Generic I/O error reading merge inputs.
    #[error("merge I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = DatabaseError::NotLocked("a/b".into());
        assert_eq!(err.to_string(), "no write-lock in 'a/b'");

        let err = ResolveError::NotMovedAway("x".into());
        assert_eq!(err.to_string(), "the node 'x' has not been moved away");

        let err = ResolveError::MixedRevisionSource("a".into());
        assert!(err.to_string().contains("mixed-revision"));

        let err = DatabaseError::ObstructedUpdate("d/f".into());
        assert!(err.to_string().contains("already in conflict"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let db_err = DatabaseError::NotFound {
            entity: "node".into(),
            path: "a/b".into(),
        };
        let core_err: CoreError = db_err.into();
        assert!(matches!(core_err, CoreError::Database(_)));

        let res_err = ResolveError::Cancelled;
        let core_err: CoreError = res_err.into();
        assert!(matches!(core_err, CoreError::Resolve(_)));
    }
}
