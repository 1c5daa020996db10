//! Database port - the target database of a migration

use crate::domain::result::Result;
use crate::domain::{LedgerEntry, LockRecord, NewLedgerEntry};

/// Kind of schema object, as removed by `drop_all`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    View,
    Table,
    Sequence,
}

impl ObjectKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            ObjectKind::View => "VIEW",
            ObjectKind::Table => "TABLE",
            ObjectKind::Sequence => "SEQUENCE",
        }
    }
}

/// A named object in the target schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,
}

/// Connection to the target database
///
/// One connection is used by one engine invocation at a time. Everything
/// the engine needs from the database goes through this trait: plain SQL
/// execution, explicit transactions, introspection for preconditions, and
/// the ledger and lock tables.
pub trait Database: Send {
    // === Session ===

    /// Schema that unqualified names resolve to, if one was set
    fn default_schema(&self) -> Option<&str>;

    /// Create the schema if needed and make it the default for this session
    fn set_default_schema(&mut self, schema: &str) -> Result<()>;

    // === Execution ===

    /// Execute one or more statements
    fn execute(&mut self, sql: &str) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// First column of the first row as text, `None` for no rows or NULL
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>>;

    // === Introspection ===

    fn table_exists(&mut self, schema: Option<&str>, table: &str) -> Result<bool>;

    fn column_exists(&mut self, schema: Option<&str>, table: &str, column: &str) -> Result<bool>;

    fn view_exists(&mut self, schema: Option<&str>, view: &str) -> Result<bool>;

    /// Views, tables and sequences in the default schema
    fn list_objects(&mut self) -> Result<Vec<SchemaObject>>;

    // === Ledger ===

    /// Create the ledger table if it does not exist
    fn ensure_ledger_table(&mut self) -> Result<()>;

    /// All ledger rows ordered by `order_executed`; empty if the table is missing
    fn read_ledger(&mut self) -> Result<Vec<LedgerEntry>>;

    /// Append a row, assigning the next `order_executed`
    fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry>;

    // === Lock ===

    /// Create the lock table if it does not exist
    fn ensure_lock_table(&mut self) -> Result<()>;

    /// Atomically insert the lock row; `false` if it is already present
    fn try_insert_lock(&mut self, holder: &str) -> Result<bool>;

    /// Delete the lock row, only if held by `holder` when one is given
    ///
    /// Returns whether a row was deleted.
    fn delete_lock(&mut self, holder: Option<&str>) -> Result<bool>;

    /// Current lock row, `None` if unlocked or the table is missing
    fn read_lock(&mut self) -> Result<Option<LockRecord>>;
}
