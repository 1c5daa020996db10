//! Execution planner - decides which changesets an update runs
//!
//! Planning checks every changeset against the run's contexts and labels and
//! against the ledger before anything executes, so a filter or checksum
//! problem aborts the run with the database untouched. Preconditions are
//! checked later, one changeset at a time, right before it is dispatched.

use crate::domain::result::{Error, Result};
use crate::domain::{
    ChangeSet, ChangeSetId, ExecType, OnFail, Precondition, Preconditions, RunReason, Selection,
};
use crate::ports::Database;

use super::ledger::LedgerSnapshot;

/// A changeset selected to run, and why
#[derive(Debug, Clone, Copy)]
pub struct PlannedChangeSet<'a> {
    pub changeset: &'a ChangeSet,
    pub reason: RunReason,
}

/// Ordered changesets an update will dispatch
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan<'a> {
    pub items: Vec<PlannedChangeSet<'a>>,
}

impl ExecutionPlan<'_> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What to do with a changeset after checking its preconditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionVerdict {
    Run,
    /// Record as MARK_RAN without executing
    MarkRan(String),
    /// Leave alone for this run
    Skip(String),
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlanner {
    contexts: Selection,
    labels: Selection,
}

impl ExecutionPlanner {
    pub fn new(contexts: Selection, labels: Selection) -> Self {
        Self { contexts, labels }
    }

    /// Whether the changeset's context and label expressions select it
    pub fn is_selected(&self, changeset: &ChangeSet) -> bool {
        changeset.context.matches(&self.contexts) && changeset.labels.matches(&self.labels)
    }

    /// Select the changesets to run, in declaration order
    pub fn plan<'a>(
        &self,
        changesets: &'a [ChangeSet],
        ledger: &LedgerSnapshot,
    ) -> Result<ExecutionPlan<'a>> {
        let mut plan = ExecutionPlan::default();
        for changeset in changesets {
            if !self.is_selected(changeset) {
                log::debug!("Skipping {}: not selected by contexts/labels", changeset.id);
                continue;
            }
            if let Some(reason) = run_reason(changeset, ledger)? {
                plan.items.push(PlannedChangeSet { changeset, reason });
            }
        }
        log::debug!("Planned {} of {} changesets", plan.len(), changesets.len());
        Ok(plan)
    }

    /// Evaluate a changeset's preconditions against the live database
    ///
    /// HALT surfaces as `Error::Precondition`; WARN logs and runs.
    pub fn check_preconditions(
        &self,
        changeset: &ChangeSet,
        db: &mut dyn Database,
        ledger: &LedgerSnapshot,
    ) -> Result<PreconditionVerdict> {
        let Some(preconditions) = &changeset.preconditions else {
            return Ok(PreconditionVerdict::Run);
        };

        let Some(failure) = first_failure(preconditions, db, ledger)? else {
            return Ok(PreconditionVerdict::Run);
        };
        let message = preconditions
            .on_fail_message
            .clone()
            .unwrap_or_else(|| format!("precondition failed: {}", failure));

        match preconditions.on_fail {
            OnFail::Halt => Err(Error::Precondition {
                changeset: changeset.id.to_string(),
                message,
            }),
            OnFail::MarkRan => {
                log::info!("Marking {} as ran: {}", changeset.id, message);
                Ok(PreconditionVerdict::MarkRan(message))
            }
            OnFail::Continue => {
                log::info!("Skipping {} for this run: {}", changeset.id, message);
                Ok(PreconditionVerdict::Skip(message))
            }
            OnFail::Warn => {
                log::warn!("{}: {} (running anyway)", changeset.id, message);
                Ok(PreconditionVerdict::Run)
            }
        }
    }
}

/// Decide whether a selected changeset runs, based on the ledger alone
fn run_reason(changeset: &ChangeSet, ledger: &LedgerSnapshot) -> Result<Option<RunReason>> {
    let current = match ledger.current(&changeset.id) {
        None => return Ok(Some(RunReason::New)),
        Some(entry) if entry.exec_type == ExecType::Failed => return Ok(Some(RunReason::Retry)),
        Some(entry) if !entry.exec_type.is_applied() => return Ok(Some(RunReason::New)),
        Some(entry) => entry,
    };

    if changeset.run_always {
        return Ok(Some(RunReason::RunAlways));
    }
    let unchanged = changeset.checksum_matches(current.checksum.as_deref());
    if changeset.run_on_change {
        return Ok((!unchanged).then_some(RunReason::RunOnChange));
    }
    if !unchanged {
        return Err(Error::ChecksumMismatch {
            changeset: changeset.id.to_string(),
            recorded: current.checksum.clone().unwrap_or_default(),
            declared: changeset.checksum.clone(),
        });
    }
    Ok(None)
}

/// Applied changesets whose declared content no longer matches the ledger
///
/// Ignores contexts and labels; used by `validate`.
pub fn checksum_errors(changesets: &[ChangeSet], ledger: &LedgerSnapshot) -> Vec<String> {
    changesets
        .iter()
        .filter(|c| !c.run_always && !c.run_on_change)
        .filter_map(|c| {
            let entry = ledger.current(&c.id).filter(|e| e.exec_type.is_applied())?;
            if c.checksum_matches(entry.checksum.as_deref()) {
                None
            } else {
                Some(format!(
                    "{}: recorded {}, declared {}",
                    c.id,
                    entry.checksum.as_deref().unwrap_or(""),
                    c.checksum
                ))
            }
        })
        .collect()
}

/// Description of the first failing condition, `None` if all hold
fn first_failure(
    preconditions: &Preconditions,
    db: &mut dyn Database,
    ledger: &LedgerSnapshot,
) -> Result<Option<String>> {
    for condition in &preconditions.conditions {
        if !holds(condition, db, ledger)? {
            return Ok(Some(condition.describe()));
        }
    }
    Ok(None)
}

fn holds(condition: &Precondition, db: &mut dyn Database, ledger: &LedgerSnapshot) -> Result<bool> {
    Ok(match condition {
        Precondition::TableExists {
            schema_name,
            table_name,
        } => db.table_exists(schema_name.as_deref(), table_name)?,
        Precondition::ColumnExists {
            schema_name,
            table_name,
            column_name,
        } => db.column_exists(schema_name.as_deref(), table_name, column_name)?,
        Precondition::ViewExists {
            schema_name,
            view_name,
        } => db.view_exists(schema_name.as_deref(), view_name)?,
        Precondition::SqlCheck {
            expected_result,
            sql,
        } => {
            let actual = db.query_scalar(sql)?;
            actual.as_deref().map(str::trim) == Some(expected_result.trim())
        }
        Precondition::ChangeSetExecuted {
            id,
            author,
            change_log_file,
        } => ledger.is_applied(&ChangeSetId::new(id, author, change_log_file)),
        Precondition::Not(inner) => {
            for c in inner {
                if holds(c, db, ledger)? {
                    return Ok(false);
                }
            }
            true
        }
        Precondition::And(inner) => {
            for c in inner {
                if !holds(c, db, ledger)? {
                    return Ok(false);
                }
            }
            true
        }
        Precondition::Or(inner) => {
            for c in inner {
                if holds(c, db, ledger)? {
                    return Ok(true);
                }
            }
            false
        }
    })
}
