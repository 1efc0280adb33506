//! Resolver configuration.
//!
//! A small set of tunables loaded from a TOML file or constructed with
//! [`Default`]. Everything here has a safe default; a missing config file is
//! not an error for library users, only `load_from` reports one.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Tunables for the working-copy database and the update-move resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Record repository commit times on installed files instead of the
    /// installation time.
    pub use_commit_times: bool,

    /// SQLite busy timeout applied at database open.
    pub db_busy_timeout_ms: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            use_commit_times: false,
            db_busy_timeout_ms: 5000,
        }
    }
}

impl ResolverConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        info!(path = %path.display(), "loading resolver configuration");

        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;

        debug!(?config, "resolver configuration loaded");
        Ok(config)
    }

    /// Validate field values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_busy_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "db_busy_timeout_ms".into(),
                detail: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}
