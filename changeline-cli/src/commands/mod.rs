//! CLI command implementations

pub mod drop_all;
pub mod locks;
pub mod logs;
pub mod rollback;
pub mod status;
pub mod update;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use dialoguer::Confirm;

use changeline_core::lifecycle::default_customizer;
use changeline_core::ports::DataSource;
use changeline_core::{
    DuckDbDataSource, EntryPoint, EventLogService, FileSystemAccessor, LogEvent, MigrationConfig,
    MigrationFacade, Selection,
};

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Config file
    #[arg(long, global = true, env = "CHANGELINE_CONFIG", default_value = "changeline.json")]
    pub config: PathBuf,

    /// DuckDB file to migrate (overrides the config)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Root changelog (overrides the config)
    #[arg(long, global = true)]
    pub changelog: Option<String>,

    /// Directory changelog paths are resolved against
    /// (default: the config file's directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Directory holding logs.duckdb
    #[arg(long, global = true, env = "CHANGELINE_LOG_DIR", default_value = ".changeline")]
    pub log_dir: PathBuf,
}

impl GlobalArgs {
    fn resource_root(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.clone();
        }
        match self.config.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Config file plus environment and command-line overrides
pub fn load_config(global: &GlobalArgs) -> Result<MigrationConfig> {
    let mut config = MigrationConfig::load(&global.config)
        .with_context(|| format!("Failed to load config {}", global.config.display()))?;
    if let Some(database) = &global.database {
        config.database = Some(database.display().to_string());
    }
    if let Some(changelog) = &global.changelog {
        config.change_log = changelog.clone();
    }
    Ok(config)
}

/// Connect to the configured database and build a facade over it
pub fn open_facade(global: &GlobalArgs, config: &MigrationConfig) -> Result<MigrationFacade> {
    let data_source = match &config.database {
        Some(path) => DuckDbDataSource::file(Path::new(path)),
        None => {
            log::warn!("No database configured; using a throwaway in-memory database");
            DuckDbDataSource::in_memory()
        }
    };
    let mut db = data_source
        .connect()
        .with_context(|| format!("Failed to connect to {}", data_source.describe()))?;
    default_customizer()(db.as_mut(), config).context("Failed to prepare the connection")?;

    let accessor = FileSystemAccessor::new(global.resource_root());
    Ok(MigrationFacade::new(db, Arc::new(accessor), config.settings()))
}

/// Selection from a flag, falling back to the config value
pub fn selection(flag: Option<&str>, configured: Selection) -> Selection {
    flag.map(Selection::parse).unwrap_or(configured)
}

/// Get the event log for CLI operations
///
/// Returns None if the log fails to open (it should never block a command)
pub fn get_logger(global: &GlobalArgs) -> Option<EventLogService> {
    match EventLogService::new(&global.log_dir, EntryPoint::Cli, env!("CARGO_PKG_VERSION")) {
        Ok(service) => Some(service),
        Err(e) => {
            log::debug!("Event log unavailable: {}", e);
            None
        }
    }
}

/// Log an event, ignoring any errors (logging should never break the app)
pub fn log_event(logger: &Option<EventLogService>, event: LogEvent) {
    if let Some(l) = logger {
        if let Err(e) = l.log(event) {
            log::debug!("Failed to write event log: {}", e);
        }
    }
}

/// Ask before a destructive operation; `force` and `json` skip the prompt
pub fn confirm(prompt: &str, force: bool, json: bool) -> Result<bool> {
    if force || json {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
