//! Adapter implementations
//!
//! Adapters implement the port traits with concrete technologies:
//! - DuckDB for the Database and DataSource ports
//! - Local filesystem for ResourceAccessor
//! - In-memory map for ResourceAccessor (embedded changelogs, tests)

pub mod duckdb;
pub mod filesystem;
pub mod memory;

pub use self::duckdb::{DuckDbDataSource, DuckDbDatabase};
pub use filesystem::FileSystemAccessor;
pub use memory::MemoryAccessor;
