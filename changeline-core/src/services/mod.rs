//! Service layer - migration engine components
//!
//! Parsing, locking, planning and execution. The facade composes these;
//! each can also be used on its own.

pub mod event_log;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod parser;
pub mod planner;
pub mod syntax;

pub use event_log::{
    CommandStats, DeploymentSummary, EntryPoint, EventLogService, LogEntry, LogEvent, LogFilter,
};
pub use executor::{CancelToken, Executor};
pub use ledger::{Ledger, LedgerSnapshot};
pub use lock::{LockGuard, LockManager};
pub use parser::ChangeLogParser;
pub use planner::{ExecutionPlan, ExecutionPlanner, PlannedChangeSet, PreconditionVerdict};
pub use syntax::check_sql_syntax;
