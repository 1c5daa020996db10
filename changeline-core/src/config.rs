//! Configuration management
//!
//! Read from `changeline.json`:
//! ```json
//! {
//!   "changeLog": "db/changelog.json",
//!   "database": "app.duckdb",
//!   "contexts": "dev",
//!   "parameters": { "schema": "app" },
//!   "defaultSchema": "app"
//! }
//! ```
//!
//! Every field is optional. Environment variables override the file, except
//! `shouldRun`: `CHANGELINE_SHOULD_RUN` is a separate host-wide switch read
//! by the lifecycle, and both must be true for startup migrations to run.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::result::{Error, Result};
use crate::domain::Selection;
use crate::facade::MigrationSettings;

/// Global switch; `false` disables startup migrations on every host.
/// Never written into `MigrationConfig::should_run`.
pub const SHOULD_RUN_ENV: &str = "CHANGELINE_SHOULD_RUN";
pub const CONTEXTS_ENV: &str = "CHANGELINE_CONTEXTS";
pub const LABELS_ENV: &str = "CHANGELINE_LABELS";
pub const DEFAULT_SCHEMA_ENV: &str = "CHANGELINE_DEFAULT_SCHEMA";
pub const DATABASE_ENV: &str = "CHANGELINE_DATABASE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationConfig {
    /// Root changelog, relative to the resource root
    pub change_log: String,
    /// DuckDB file; in-memory when absent
    pub database: Option<String>,
    pub should_run: bool,
    pub contexts: String,
    pub labels: String,
    pub parameters: BTreeMap<String, String>,
    pub default_schema: Option<String>,
    pub drop_first: bool,
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            change_log: "changelog.json".to_string(),
            database: None,
            should_run: true,
            contexts: String::new(),
            labels: String::new(),
            parameters: BTreeMap::new(),
            default_schema: None,
            drop_first: false,
            lock_timeout_secs: 300,
            lock_poll_interval_ms: 1000,
        }
    }
}

impl MigrationConfig {
    /// Load from a JSON file, then apply environment overrides
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in `load`)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(CONTEXTS_ENV) {
            self.contexts = value;
        }
        if let Some(value) = lookup(LABELS_ENV) {
            self.labels = value;
        }
        if let Some(value) = lookup(DEFAULT_SCHEMA_ENV).filter(|v| !v.trim().is_empty()) {
            self.default_schema = Some(value);
        }
        if let Some(value) = lookup(DATABASE_ENV).filter(|v| !v.trim().is_empty()) {
            self.database = Some(value);
        }
        Ok(())
    }

    pub fn contexts(&self) -> Selection {
        Selection::parse(&self.contexts)
    }

    pub fn labels(&self) -> Selection {
        Selection::parse(&self.labels)
    }

    pub fn settings(&self) -> MigrationSettings {
        MigrationSettings {
            changelog: self.change_log.clone(),
            parameters: self.parameters.clone(),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            lock_poll_interval: Duration::from_millis(self.lock_poll_interval_ms),
        }
    }
}

/// Parse a boolean switch
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" | "yes" | "TRUE" | "YES" | "True" => Ok(true),
        "false" | "0" | "no" | "FALSE" | "NO" | "False" => Ok(false),
        other => Err(Error::config(format!(
            "{} must be true or false, got '{}'",
            key, other
        ))),
    }
}
