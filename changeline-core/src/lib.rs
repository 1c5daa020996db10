//! Changeline Core - changelog-driven schema migrations
//!
//! This crate implements the migration engine following hexagonal architecture:
//!
//! - **domain**: Changesets, changes, ledger rows and reports
//! - **ports**: Trait definitions for external dependencies (Database, ResourceAccessor)
//! - **services**: Parser, lock, planner and executor
//! - **adapters**: Concrete implementations (DuckDB, filesystem, in-memory resources)
//!
//! [`MigrationFacade`] is the entry point for one-off operations;
//! [`MigrationLifecycle`] runs migrations while a host application starts.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod facade;
pub mod lifecycle;
mod log_migrations;
pub mod ports;
pub mod services;

pub use adapters::{DuckDbDataSource, DuckDbDatabase, FileSystemAccessor, MemoryAccessor};
pub use config::MigrationConfig;
pub use domain::result::{Error, Result};
pub use domain::{
    ChangeSet, ChangeSetId, ChangeSetRef, DropReport, ExecutionReport, LockStatus,
    OutcomeStatus, Selection, StatusReport, ValidationReport,
};
pub use facade::{MigrationFacade, MigrationSettings};
pub use lifecycle::{DatabaseCustomizer, MigrationLifecycle};
pub use services::{CancelToken, EntryPoint, EventLogService, LogEvent, LogFilter};
