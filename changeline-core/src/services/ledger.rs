//! Ledger service - history of applied changesets in the target database
//!
//! The ledger table is append-only. A changeset's current state is its most
//! recent row; rollbacks and failures are new rows, never updates.

use std::collections::HashMap;

use chrono::Utc;

use crate::domain::result::Result;
use crate::domain::{ChangeSet, ChangeSetId, ExecType, LedgerEntry, NewLedgerEntry};
use crate::ports::Database;

/// In-memory copy of the ledger, indexed by changeset identity
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    entries: Vec<LedgerEntry>,
    /// Index into `entries` of each changeset's latest row
    current: HashMap<ChangeSetId, usize>,
    /// Index of each changeset's latest row that is not FAILED
    settled: HashMap<ChangeSetId, usize>,
}

impl LedgerSnapshot {
    pub fn from_entries(mut entries: Vec<LedgerEntry>) -> Self {
        entries.sort_by_key(|e| e.order_executed);
        let mut snapshot = Self::default();
        for entry in entries {
            snapshot.push(entry);
        }
        snapshot
    }

    pub fn push(&mut self, entry: LedgerEntry) {
        let index = self.entries.len();
        if entry.exec_type != ExecType::Failed {
            self.settled.insert(entry.changeset.clone(), index);
        }
        self.current.insert(entry.changeset.clone(), index);
        self.entries.push(entry);
    }

    /// Every row, in execution order
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn current(&self, id: &ChangeSetId) -> Option<&LedgerEntry> {
        self.current.get(id).map(|&i| &self.entries[i])
    }

    pub fn is_applied(&self, id: &ChangeSetId) -> bool {
        self.current(id).is_some_and(|e| e.exec_type.is_applied())
    }

    /// Whether the changeset stays applied once FAILED rows are ignored
    ///
    /// A failed re-run of an applied changeset does not undo it, so its
    /// next success is a RERAN. A ROLLED_BACK row does undo it.
    pub fn was_applied(&self, id: &ChangeSetId) -> bool {
        self.settled
            .get(id)
            .is_some_and(|&i| self.entries[i].exec_type.is_applied())
    }

    /// Latest row of every applied changeset, ordered by when it was applied
    pub fn applied(&self) -> Vec<&LedgerEntry> {
        let mut applied: Vec<&LedgerEntry> = self
            .current
            .values()
            .map(|&i| &self.entries[i])
            .filter(|e| e.exec_type.is_applied())
            .collect();
        applied.sort_by_key(|e| e.order_executed);
        applied
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads and appends ledger rows for one deployment
pub struct Ledger {
    deployment_id: String,
    snapshot: LedgerSnapshot,
}

impl Ledger {
    /// Load the current ledger; a missing ledger table reads as empty
    pub fn load(db: &mut dyn Database, deployment_id: impl Into<String>) -> Result<Self> {
        let snapshot = LedgerSnapshot::from_entries(db.read_ledger()?);
        log::debug!("Loaded ledger with {} entries", snapshot.len());
        Ok(Self {
            deployment_id: deployment_id.into(),
            snapshot,
        })
    }

    pub fn ensure_table(db: &mut dyn Database) -> Result<()> {
        db.ensure_ledger_table()
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    pub fn is_applied(&self, id: &ChangeSetId) -> bool {
        self.snapshot.is_applied(id)
    }

    /// Ledger type for a successful run: RERAN if it was applied before
    pub fn success_type(&self, id: &ChangeSetId) -> ExecType {
        if self.snapshot.was_applied(id) {
            ExecType::Reran
        } else {
            ExecType::Executed
        }
    }

    /// Build the row describing one execution of `changeset`
    pub fn entry_for(
        &self,
        changeset: &ChangeSet,
        exec_type: ExecType,
        duration_ms: Option<i64>,
        error_message: Option<String>,
    ) -> NewLedgerEntry {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        NewLedgerEntry {
            changeset: changeset.id.clone(),
            date_executed: Utc::now(),
            exec_type,
            checksum: Some(changeset.checksum.clone()),
            description: Some(changeset.description()),
            comments: changeset.comment.clone(),
            contexts: non_empty(changeset.context.to_string()),
            labels: non_empty(changeset.labels.to_string()),
            duration_ms,
            error_message,
            deployment_id: self.deployment_id.clone(),
        }
    }

    /// Append a row without updating the snapshot
    ///
    /// Used inside a changeset's transaction; call `remember` after commit.
    pub fn write(&self, db: &mut dyn Database, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        db.insert_ledger_entry(entry)
    }

    pub fn remember(&mut self, entry: LedgerEntry) {
        self.snapshot.push(entry);
    }

    /// Append a row in autocommit mode and update the snapshot
    pub fn record(&mut self, db: &mut dyn Database, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let written = self.write(db, entry)?;
        self.remember(written.clone());
        Ok(written)
    }
}
