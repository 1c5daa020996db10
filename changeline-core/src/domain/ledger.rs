//! Ledger entries - the persisted history of changeset executions

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::changeset::ChangeSetId;
use super::result::Error;

/// Name of the ledger table in the target schema
pub const LEDGER_TABLE: &str = "changeline_ledger";

/// Outcome recorded for one execution of a changeset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    /// First successful execution
    Executed,
    /// Successful execution of a changeset that was already applied
    Reran,
    /// Execution failed and was rolled back
    Failed,
    /// Recorded as ran without executing (precondition MARK_RAN)
    MarkRan,
    /// Undone by a rollback
    RolledBack,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecType::Executed => "EXECUTED",
            ExecType::Reran => "RERAN",
            ExecType::Failed => "FAILED",
            ExecType::MarkRan => "MARK_RAN",
            ExecType::RolledBack => "ROLLED_BACK",
        }
    }

    /// Whether a changeset whose latest entry has this type counts as applied
    pub fn is_applied(&self) -> bool {
        matches!(self, ExecType::Executed | ExecType::Reran | ExecType::MarkRan)
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTED" => Ok(ExecType::Executed),
            "RERAN" => Ok(ExecType::Reran),
            "FAILED" => Ok(ExecType::Failed),
            "MARK_RAN" => Ok(ExecType::MarkRan),
            "ROLLED_BACK" => Ok(ExecType::RolledBack),
            other => Err(Error::database(format!("unknown ledger exec type '{}'", other))),
        }
    }
}

/// A ledger row as stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Strictly increasing, never reused
    pub order_executed: i64,
    pub changeset: ChangeSetId,
    pub date_executed: DateTime<Utc>,
    pub exec_type: ExecType,
    pub checksum: Option<String>,
    pub description: Option<String>,
    pub comments: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub deployment_id: String,
}

/// A ledger row about to be appended; the store assigns `order_executed`
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub changeset: ChangeSetId,
    pub date_executed: DateTime<Utc>,
    pub exec_type: ExecType,
    pub checksum: Option<String>,
    pub description: Option<String>,
    pub comments: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub deployment_id: String,
}

impl NewLedgerEntry {
    pub fn into_entry(self, order_executed: i64) -> LedgerEntry {
        LedgerEntry {
            order_executed,
            changeset: self.changeset,
            date_executed: self.date_executed,
            exec_type: self.exec_type,
            checksum: self.checksum,
            description: self.description,
            comments: self.comments,
            contexts: self.contexts,
            labels: self.labels,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            deployment_id: self.deployment_id,
        }
    }
}
