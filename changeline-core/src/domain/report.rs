//! Reports returned by engine operations

use serde::Serialize;

use super::changeset::ChangeSetId;
use super::ledger::LedgerEntry;
use super::lock::LockRecord;

/// Why a changeset is part of an execution plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    /// Never applied (or rolled back since)
    New,
    /// Previous attempt failed
    Retry,
    /// `runAlways` changeset
    RunAlways,
    /// `runOnChange` changeset whose content changed
    RunOnChange,
}

/// What happened to one changeset during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Executed,
    Reran,
    MarkRan,
    /// Precondition failed with CONTINUE; nothing recorded
    Skipped,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSetOutcome {
    pub changeset: ChangeSetId,
    pub status: OutcomeStatus,
    pub duration_ms: u64,
    /// Ledger sequence number of the entry written for this outcome
    pub order_executed: Option<i64>,
    pub error: Option<String>,
}

/// Result of `update` or a rollback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub deployment_id: String,
    pub outcomes: Vec<ChangeSetOutcome>,
    /// First error encountered, whether or not it halted the run
    pub first_error: Option<String>,
    /// Run stopped early by a cancellation request
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            outcomes: Vec::new(),
            first_error: None,
            cancelled: false,
        }
    }

    pub fn push(&mut self, outcome: ChangeSetOutcome) {
        if self.first_error.is_none() {
            if let Some(err) = &outcome.error {
                self.first_error = Some(format!("{}: {}", outcome.changeset, err));
            }
        }
        self.outcomes.push(outcome);
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Changesets whose SQL actually ran successfully
    pub fn applied_count(&self) -> usize {
        self.count(OutcomeStatus::Executed) + self.count(OutcomeStatus::Reran)
    }

    pub fn is_success(&self) -> bool {
        self.count(OutcomeStatus::Failed) == 0 && !self.cancelled
    }
}

/// A changeset that `update` would run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingChangeSet {
    pub changeset: ChangeSetId,
    pub reason: RunReason,
    pub description: String,
}

/// Result of `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Current state of every applied changeset, in execution order
    pub applied: Vec<LedgerEntry>,
    pub pending: Vec<PendingChangeSet>,
    /// Applied changesets no longer declared in the changelog
    pub unknown: Vec<ChangeSetId>,
}

impl StatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Result of `drop_all`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DropReport {
    pub dropped: Vec<String>,
}

/// Result of `validate`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub changesets: usize,
    pub checksum_errors: Vec<String>,
    pub syntax_warnings: Vec<String>,
    /// Changesets that could not be rolled back automatically
    pub missing_rollback: Vec<ChangeSetId>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.checksum_errors.is_empty()
    }
}

/// Lock information for `list_locks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub record: Option<LockRecord>,
}
