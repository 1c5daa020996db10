//! DuckDB implementation of the Database port

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Connection};

use crate::domain::result::{Error, Result};
use crate::domain::{LedgerEntry, LockRecord, NewLedgerEntry, LEDGER_TABLE, LOCK_TABLE};
use crate::ports::{DataSource, Database, ObjectKind, SchemaObject};

impl From<duckdb::Error> for Error {
    fn from(err: duckdb::Error) -> Self {
        Error::Database(err.to_string())
    }
}

/// Maximum number of retries when database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400, 800ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
}

/// Check if an insert failed because the row is already there
///
/// Two connections racing for the lock row surface either a constraint
/// violation or a transaction conflict depending on timing.
fn is_conflict_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    lower.contains("constraint") || lower.contains("duplicate") || lower.contains("conflict")
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// DuckDB connection to a migration target
pub struct DuckDbDatabase {
    conn: Mutex<Connection>,
    location: String,
    default_schema: Option<String>,
}

impl DuckDbDatabase {
    /// Open (or create) a database file
    ///
    /// Includes retry logic with exponential backoff for file locking errors,
    /// which occur when another process has the file open.
    pub fn new(db_path: &Path) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    return Ok(Self::from_connection(conn, db_path.display().to_string()));
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        log::warn!(
                            "Database busy, retrying in {}ms (attempt {}/{}): {}",
                            delay.as_millis(),
                            attempt + 1,
                            MAX_RETRIES,
                            err_msg
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::database(format!("Failed to open database after {} retries", MAX_RETRIES))
        }))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        let conn = Connection::open_in_memory_with_flags(config)?;
        Ok(Self::from_connection(conn, ":memory:".to_string()))
    }

    fn try_open_connection(db_path: &Path) -> Result<Connection> {
        // Extension autoloading is disabled; JSON is statically linked via the
        // "json" Cargo feature
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Ok(Connection::open_with_flags(db_path, config)?)
    }

    fn from_connection(conn: Connection, location: String) -> Self {
        Self {
            conn: Mutex::new(conn),
            location,
            default_schema: None,
        }
    }

    /// Open another connection to the same database
    ///
    /// The new connection starts in the database's default schema.
    pub fn try_clone(&self) -> Result<Self> {
        let conn = self.conn()?.try_clone()?;
        Ok(Self::from_connection(conn, self.location.clone()))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Run `f` against the raw connection
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }

    /// Resolve an optional schema to the session's current one
    fn schema_or_current(conn: &Connection, schema: Option<&str>) -> Result<String> {
        match schema {
            Some(schema) => Ok(schema.to_string()),
            None => Ok(conn.query_row("SELECT current_schema()", [], |row| row.get(0))?),
        }
    }

    fn object_exists(&self, schema: Option<&str>, name: &str, table_type: &str) -> Result<bool> {
        let conn = self.conn()?;
        let schema = Self::schema_or_current(&conn, schema)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables
             WHERE table_catalog = current_database()
               AND lower(table_schema) = lower(?)
               AND lower(table_name) = lower(?)
               AND table_type = ?",
            params![schema, name, table_type],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_kind(&self, kind: ObjectKind, sql: &str) -> Result<Vec<SchemaObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(SchemaObject {
                kind,
                schema: row.get(0)?,
                name: row.get(1)?,
            })
        })?;

        let mut objects = Vec::new();
        for row in rows {
            objects.push(row?);
        }
        Ok(objects)
    }
}

impl Database for DuckDbDatabase {
    fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }

    fn set_default_schema(&mut self, schema: &str) -> Result<()> {
        {
            let conn = self.conn()?;
            conn.execute_batch(&format!(
                "CREATE SCHEMA IF NOT EXISTS \"{ident}\"; SET schema = '{literal}';",
                ident = schema.replace('"', "\"\""),
                literal = schema.replace('\'', "''"),
            ))?;
        }
        self.default_schema = Some(schema.to_string());
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN TRANSACTION")
    }

    fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK")
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        // Cast so any column type can be compared as text
        let wrapped = format!(
            "SELECT CAST(COLUMNS(*) AS VARCHAR) FROM ({}) q LIMIT 1",
            sql.trim().trim_end_matches(';')
        );
        let mut stmt = conn.prepare(&wrapped)?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(row.get::<_, Option<String>>(0)?),
            None => Ok(None),
        }
    }

    fn table_exists(&mut self, schema: Option<&str>, table: &str) -> Result<bool> {
        self.object_exists(schema, table, "BASE TABLE")
    }

    fn column_exists(&mut self, schema: Option<&str>, table: &str, column: &str) -> Result<bool> {
        let conn = self.conn()?;
        let schema = Self::schema_or_current(&conn, schema)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM information_schema.columns
             WHERE table_catalog = current_database()
               AND lower(table_schema) = lower(?)
               AND lower(table_name) = lower(?)
               AND lower(column_name) = lower(?)",
            params![schema, table, column],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn view_exists(&mut self, schema: Option<&str>, view: &str) -> Result<bool> {
        self.object_exists(schema, view, "VIEW")
    }

    fn list_objects(&mut self) -> Result<Vec<SchemaObject>> {
        let mut objects = self.list_kind(
            ObjectKind::View,
            "SELECT schema_name, view_name FROM duckdb_views()
             WHERE NOT internal AND database_name = current_database()
               AND schema_name = current_schema()
             ORDER BY view_name",
        )?;
        objects.extend(self.list_kind(
            ObjectKind::Table,
            "SELECT schema_name, table_name FROM duckdb_tables()
             WHERE database_name = current_database() AND schema_name = current_schema()
             ORDER BY table_name",
        )?);
        objects.extend(self.list_kind(
            ObjectKind::Sequence,
            "SELECT schema_name, sequence_name FROM duckdb_sequences()
             WHERE database_name = current_database() AND schema_name = current_schema()
             ORDER BY sequence_name",
        )?);
        Ok(objects)
    }

    fn ensure_ledger_table(&mut self) -> Result<()> {
        self.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                order_executed BIGINT PRIMARY KEY,
                id VARCHAR NOT NULL,
                author VARCHAR NOT NULL,
                filename VARCHAR NOT NULL,
                date_executed TIMESTAMP NOT NULL,
                exec_type VARCHAR NOT NULL,
                checksum VARCHAR,
                description VARCHAR,
                comments VARCHAR,
                contexts VARCHAR,
                labels VARCHAR,
                duration_ms BIGINT,
                error_message VARCHAR,
                deployment_id VARCHAR NOT NULL
            )"
        ))
    }

    fn read_ledger(&mut self) -> Result<Vec<LedgerEntry>> {
        if !self.table_exists(None, LEDGER_TABLE)? {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT order_executed, id, author, filename, CAST(date_executed AS VARCHAR),
                    exec_type, checksum, description, comments, contexts, labels,
                    duration_ms, error_message, deployment_id
             FROM {LEDGER_TABLE}
             ORDER BY order_executed"
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok(LedgerRow {
                order_executed: row.get(0)?,
                id: row.get(1)?,
                author: row.get(2)?,
                filename: row.get(3)?,
                date_executed: row.get(4)?,
                exec_type: row.get(5)?,
                checksum: row.get(6)?,
                description: row.get(7)?,
                comments: row.get(8)?,
                contexts: row.get(9)?,
                labels: row.get(10)?,
                duration_ms: row.get(11)?,
                error_message: row.get(12)?,
                deployment_id: row.get(13)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let conn = self.conn()?;
        let order: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(order_executed), 0) + 1 FROM {LEDGER_TABLE}"),
            [],
            |row| row.get(0),
        )?;

        conn.execute(
            &format!(
                "INSERT INTO {LEDGER_TABLE} (
                    order_executed, id, author, filename, date_executed, exec_type,
                    checksum, description, comments, contexts, labels,
                    duration_ms, error_message, deployment_id
                ) VALUES (?, ?, ?, ?, CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                order,
                &entry.changeset.id,
                &entry.changeset.author,
                &entry.changeset.path,
                entry.date_executed.format(TIMESTAMP_FORMAT).to_string(),
                entry.exec_type.as_str(),
                &entry.checksum,
                &entry.description,
                &entry.comments,
                &entry.contexts,
                &entry.labels,
                entry.duration_ms,
                &entry.error_message,
                &entry.deployment_id,
            ],
        )?;

        Ok(entry.into_entry(order))
    }

    fn ensure_lock_table(&mut self) -> Result<()> {
        self.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
                id INTEGER PRIMARY KEY,
                locked_by VARCHAR NOT NULL,
                locked_at TIMESTAMP NOT NULL
            )"
        ))
    }

    fn try_insert_lock(&mut self, holder: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let result = conn.execute(
            &format!(
                "INSERT INTO {LOCK_TABLE} (id, locked_by, locked_at)
                 VALUES (1, ?, CAST(? AS TIMESTAMP))
                 ON CONFLICT DO NOTHING"
            ),
            params![holder, now],
        );

        match result {
            Ok(inserted) => Ok(inserted == 1),
            Err(e) if is_conflict_error(&e.to_string()) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_lock(&mut self, holder: Option<&str>) -> Result<bool> {
        if !self.table_exists(None, LOCK_TABLE)? {
            return Ok(false);
        }
        let conn = self.conn()?;
        let deleted = match holder {
            Some(holder) => conn.execute(
                &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND locked_by = ?"),
                [holder],
            )?,
            None => conn.execute(&format!("DELETE FROM {LOCK_TABLE} WHERE id = 1"), [])?,
        };
        Ok(deleted > 0)
    }

    fn read_lock(&mut self) -> Result<Option<LockRecord>> {
        if !self.table_exists(None, LOCK_TABLE)? {
            return Ok(None);
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT locked_by, CAST(locked_at AS VARCHAR) FROM {LOCK_TABLE} WHERE id = 1"
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let locked_at: String = row.get(1)?;
                Ok(Some(LockRecord {
                    locked_by: row.get(0)?,
                    locked_at: parse_timestamp(&locked_at),
                }))
            }
            None => Ok(None),
        }
    }
}

/// Raw ledger row before exec type parsing
struct LedgerRow {
    order_executed: i64,
    id: String,
    author: String,
    filename: String,
    date_executed: String,
    exec_type: String,
    checksum: Option<String>,
    description: Option<String>,
    comments: Option<String>,
    contexts: Option<String>,
    labels: Option<String>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    deployment_id: String,
}

impl LedgerRow {
    fn into_entry(self) -> Result<LedgerEntry> {
        Ok(LedgerEntry {
            order_executed: self.order_executed,
            changeset: crate::domain::ChangeSetId::new(self.id, self.author, self.filename),
            date_executed: parse_timestamp(&self.date_executed),
            exec_type: self.exec_type.parse()?,
            checksum: self.checksum,
            description: self.description,
            comments: self.comments,
            contexts: self.contexts,
            labels: self.labels,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            deployment_id: self.deployment_id,
        })
    }
}

/// Opens DuckDB connections for the lifecycle wrapper and the CLI
#[derive(Debug, Clone)]
pub struct DuckDbDataSource {
    path: Option<PathBuf>,
}

impl DuckDbDataSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Every `connect` opens a fresh, empty in-memory database
    pub fn in_memory() -> Self {
        Self { path: None }
    }
}

impl DataSource for DuckDbDataSource {
    fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    fn connect(&self) -> Result<Box<dyn Database>> {
        let db = match &self.path {
            Some(path) => DuckDbDatabase::new(path)?,
            None => DuckDbDatabase::open_in_memory()?,
        };
        Ok(Box::new(db))
    }
}

/// Parse a timestamp as rendered by `CAST(ts AS VARCHAR)`
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| {
            log::warn!("Unparseable timestamp '{}' in database, using now", s);
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeSetId, ExecType};

    fn new_entry(id: &str, exec_type: ExecType) -> NewLedgerEntry {
        NewLedgerEntry {
            changeset: ChangeSetId::new(id, "alice", "main.json"),
            date_executed: Utc::now(),
            exec_type,
            checksum: Some("1:abc".to_string()),
            description: Some("sql".to_string()),
            comments: None,
            contexts: None,
            labels: None,
            duration_ms: Some(5),
            error_message: None,
            deployment_id: "d1".to_string(),
        }
    }

    #[test]
    fn test_read_ledger_without_table_is_empty() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        assert!(db.read_ledger().unwrap().is_empty());
    }

    #[test]
    fn test_ledger_order_is_increasing() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        db.ensure_ledger_table().unwrap();

        let first = db.insert_ledger_entry(new_entry("1", ExecType::Executed)).unwrap();
        let second = db.insert_ledger_entry(new_entry("2", ExecType::Failed)).unwrap();
        assert_eq!(first.order_executed, 1);
        assert_eq!(second.order_executed, 2);

        let rows = db.read_ledger().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].exec_type, ExecType::Failed);
        assert_eq!(rows[0].changeset, ChangeSetId::new("1", "alice", "main.json"));
        assert_eq!(rows[0].duration_ms, Some(5));
    }

    #[test]
    fn test_lock_insert_is_exclusive() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        db.ensure_lock_table().unwrap();

        assert!(db.try_insert_lock("a").unwrap());
        assert!(!db.try_insert_lock("b").unwrap());
        assert_eq!(db.read_lock().unwrap().unwrap().locked_by, "a");

        // Only the holder may release without force
        assert!(!db.delete_lock(Some("b")).unwrap());
        assert!(db.delete_lock(Some("a")).unwrap());
        assert!(db.read_lock().unwrap().is_none());
    }

    #[test]
    fn test_query_scalar_casts_to_text() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        assert_eq!(db.query_scalar("SELECT 42;").unwrap().as_deref(), Some("42"));
        assert_eq!(db.query_scalar("SELECT NULL").unwrap(), None);
        assert_eq!(
            db.query_scalar("SELECT 1 WHERE false").unwrap(),
            None
        );
    }

    #[test]
    fn test_introspection_and_default_schema() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        db.set_default_schema("app").unwrap();
        db.execute("CREATE TABLE users (id INTEGER, email VARCHAR); CREATE VIEW v_users AS SELECT id FROM users")
            .unwrap();

        assert_eq!(db.default_schema(), Some("app"));
        assert!(db.table_exists(None, "users").unwrap());
        assert!(db.table_exists(Some("app"), "USERS").unwrap());
        assert!(!db.table_exists(Some("main"), "users").unwrap());
        assert!(!db.table_exists(None, "v_users").unwrap());
        assert!(db.view_exists(None, "v_users").unwrap());
        assert!(db.column_exists(None, "users", "email").unwrap());
        assert!(!db.column_exists(None, "users", "name").unwrap());

        let objects = db.list_objects().unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, ObjectKind::View);
        assert_eq!(objects[1].name, "users");
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER)").unwrap();

        db.begin().unwrap();
        db.execute("INSERT INTO t VALUES (1)").unwrap();
        assert!(db.execute("INSERT INTO missing VALUES (1)").is_err());
        db.rollback().unwrap();

        assert_eq!(db.query_scalar("SELECT COUNT(*) FROM t").unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let a = parse_timestamp("2024-03-01 10:20:30.123456");
        let b = parse_timestamp("2024-03-01 10:20:30");
        assert_eq!(a.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-01 10:20:30");
        assert_eq!(b.format("%H:%M").to_string(), "10:20");
    }
}
