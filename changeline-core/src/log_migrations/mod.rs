//! Event log schema - an embedded changelog
//!
//! The log database is migrated with the engine itself. New schema changes
//! are appended as changesets to `changelog.json`; applied changesets must
//! never be edited.

/// Logical path of the embedded changelog
pub const LOG_CHANGELOG_PATH: &str = "log_migrations/changelog.json";

/// The changelog document, embedded at compile time
pub const LOG_CHANGELOG: &str = include_str!("changelog.json");
