//! Core domain entities
//!
//! Changesets, changes, ledger rows and reports. These are plain data
//! structures with their own validation and SQL generation - no I/O.

pub mod change;
pub mod changeset;
pub mod checksum;
pub mod expression;
pub mod ledger;
pub mod lock;
pub mod report;
pub mod result;

pub use change::{Change, ChangeRegistry, CustomChange, SqlContext};
pub use changeset::{ChangeSet, ChangeSetId, ChangeSetRef, OnFail, Precondition, Preconditions};
pub use expression::{Expression, Selection};
pub use ledger::{ExecType, LedgerEntry, NewLedgerEntry, LEDGER_TABLE};
pub use lock::{LockRecord, LOCK_TABLE};
pub use report::{
    ChangeSetOutcome, DropReport, ExecutionReport, LockStatus, OutcomeStatus, PendingChangeSet,
    RunReason, StatusReport, ValidationReport,
};
pub use result::{Error, Result};
