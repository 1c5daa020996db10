//! Event log - structured record of migration runs in logs.duckdb
//!
//! Kept apart from the migration targets so that the history survives a
//! `drop-all`. The `sys_logs` table is created by running the engine on its
//! own embedded changelog.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duckdb::Row;
use serde::{Deserialize, Serialize};

use crate::adapters::{DuckDbDatabase, MemoryAccessor};
use crate::domain::result::Result;
use crate::domain::Selection;
use crate::facade::{MigrationFacade, MigrationSettings};
use crate::log_migrations::{LOG_CHANGELOG, LOG_CHANGELOG_PATH};

/// Counter for generating unique IDs within the same millisecond
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Timestamp in the lower 48 bits, counter in the upper 16
fn generate_id() -> u64 {
    let timestamp = now_ms() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    (timestamp << 16) | counter
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn detect_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

/// What started the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    Cli,
    Startup,
}

impl EntryPoint {
    fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Cli => "cli",
            EntryPoint::Startup => "startup",
        }
    }
}

/// An event to be recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            deployment_id: None,
            command: None,
            error_message: None,
            error_details: None,
        }
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

/// A row of `sys_logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub entry_point: String,
    pub app_version: String,
    pub platform: String,
    pub event: String,
    pub deployment_id: Option<String>,
    pub command: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
}

impl LogEntry {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            entry_point: row.get(2)?,
            app_version: row.get(3)?,
            platform: row.get(4)?,
            event: row.get(5)?,
            deployment_id: row.get(6)?,
            command: row.get(7)?,
            error_message: row.get(8)?,
            error_details: row.get(9)?,
        })
    }
}

/// Which entries `EventLogService::find` returns
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub command: Option<String>,
    pub deployment_id: Option<String>,
    pub errors_only: bool,
    pub limit: usize,
}

impl LogFilter {
    /// The newest `limit` entries
    pub fn latest(limit: usize) -> Self {
        Self {
            command: None,
            deployment_id: None,
            errors_only: false,
            limit,
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }
}

/// Events logged under one deployment id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSummary {
    pub deployment_id: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub command: Option<String>,
    pub last_event: String,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandStats {
    pub command: String,
    pub events: u64,
    pub errors: u64,
    pub last_seen: i64,
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, entry_point, app_version, platform, \
     event, deployment_id, command, error_message, error_details FROM sys_logs";

/// Writes and queries the event log
pub struct EventLogService {
    db: DuckDbDatabase,
    db_path: PathBuf,
    entry_point: EntryPoint,
    app_version: String,
    platform: &'static str,
}

impl EventLogService {
    /// Open or create `logs.duckdb` in `dir` and bring its schema up to date
    pub fn new(dir: &Path, entry_point: EntryPoint, app_version: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("logs.duckdb");
        let db = DuckDbDatabase::new(&db_path)?;

        let service = Self {
            db,
            db_path,
            entry_point,
            app_version: app_version.into(),
            platform: detect_platform(),
        };
        service.run_migrations()?;
        Ok(service)
    }

    fn run_migrations(&self) -> Result<()> {
        let accessor = MemoryAccessor::new().with(LOG_CHANGELOG_PATH, LOG_CHANGELOG);
        let settings = MigrationSettings {
            lock_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(100),
            ..MigrationSettings::new(LOG_CHANGELOG_PATH)
        };
        let mut facade =
            MigrationFacade::new(Box::new(self.db.try_clone()?), Arc::new(accessor), settings);
        let report = facade.update(&Selection::default(), &Selection::default())?;
        if report.applied_count() > 0 {
            log::debug!("Applied {} event log migrations", report.applied_count());
        }
        Ok(())
    }

    /// Record an event; entry point, version and platform come from the service
    pub fn log(&self, event: LogEvent) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sys_logs (
                    id, timestamp, entry_point, app_version, platform,
                    event, deployment_id, command, error_message, error_details
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    generate_id(),
                    now_ms(),
                    self.entry_point.as_str(),
                    &self.app_version,
                    self.platform,
                    &event.event,
                    &event.deployment_id,
                    &event.command,
                    &event.error_message,
                    &event.error_details,
                ],
            )?;
            Ok(())
        })
    }

    /// Entries matching `filter`, newest first
    pub fn find(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let mut conditions = Vec::new();
        let mut params: Vec<&str> = Vec::new();
        if let Some(command) = &filter.command {
            conditions.push("command = ?");
            params.push(command);
        }
        if let Some(deployment_id) = &filter.deployment_id {
            conditions.push("deployment_id = ?");
            params.push(deployment_id);
        }
        if filter.errors_only {
            conditions.push("error_message IS NOT NULL");
        }

        let mut sql = SELECT_COLUMNS.to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {}", filter.limit));

        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(duckdb::params_from_iter(params), LogEntry::from_row)?
                .collect::<duckdb::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// One line per deployment, most recent first
    pub fn deployments(&self, limit: usize) -> Result<Vec<DeploymentSummary>> {
        let sql = format!(
            "SELECT deployment_id, MIN(timestamp), MAX(timestamp), \
                    arg_max(command, timestamp), arg_max(event, timestamp), COUNT(error_message) \
             FROM sys_logs WHERE deployment_id IS NOT NULL \
             GROUP BY deployment_id ORDER BY MAX(timestamp) DESC LIMIT {}",
            limit
        );
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(DeploymentSummary {
                        deployment_id: row.get(0)?,
                        first_seen: row.get(1)?,
                        last_seen: row.get(2)?,
                        command: row.get(3)?,
                        last_event: row.get(4)?,
                        errors: row.get::<_, i64>(5)? as u64,
                    })
                })?
                .collect::<duckdb::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Event and error counts per command, busiest first
    pub fn command_stats(&self) -> Result<Vec<CommandStats>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT command, COUNT(*), COUNT(error_message), MAX(timestamp) \
                 FROM sys_logs WHERE command IS NOT NULL \
                 GROUP BY command ORDER BY COUNT(*) DESC, command",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(CommandStats {
                        command: row.get(0)?,
                        events: row.get::<_, i64>(1)? as u64,
                        errors: row.get::<_, i64>(2)? as u64,
                        last_seen: row.get(3)?,
                    })
                })?
                .collect::<duckdb::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.db.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Remove entries logged before `timestamp_ms` (unix milliseconds)
    pub fn prune_before(&self, timestamp_ms: i64) -> Result<u64> {
        self.db.with_connection(|conn| {
            let removed = conn.execute("DELETE FROM sys_logs WHERE timestamp < ?", [timestamp_ms])?;
            Ok(removed as u64)
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
