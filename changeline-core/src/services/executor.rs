//! Executor - applies planned changesets and rollbacks
//!
//! Each changeset runs in its own transaction (unless it opts out) and its
//! ledger row is written inside that transaction, so a changeset is either
//! applied and recorded or neither. A failure is rolled back and then
//! recorded as FAILED in a separate statement. There is no outer
//! transaction: a re-run resumes at the first changeset not yet applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::domain::result::{Error, Result};
use crate::domain::{
    ChangeRegistry, ChangeSet, ChangeSetOutcome, ExecType, ExecutionReport, LedgerEntry,
    OutcomeStatus, SqlContext,
};
use crate::ports::Database;

use super::ledger::Ledger;
use super::planner::{ExecutionPlan, ExecutionPlanner, PreconditionVerdict};

/// Cooperative cancellation, checked between changesets
///
/// A request is consumed by the first run that observes it, so a token
/// can be reused for later runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a request is pending
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Take a pending request, clearing it
    fn consume(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

pub struct Executor<'r> {
    planner: &'r ExecutionPlanner,
    registry: &'r ChangeRegistry,
    cancel: CancelToken,
}

impl<'r> Executor<'r> {
    pub fn new(planner: &'r ExecutionPlanner, registry: &'r ChangeRegistry) -> Self {
        Self {
            planner,
            registry,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every planned changeset in order
    ///
    /// Stops with `Error::MigrationFailure` at the first failed changeset
    /// that has `fail_on_error`; other failures are recorded and skipped.
    /// Any other error once the run has started (a HALT precondition, a
    /// ledger write) also stops it, wrapped with the partial report.
    pub fn run(
        &self,
        plan: &ExecutionPlan<'_>,
        db: &mut dyn Database,
        ledger: &mut Ledger,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::new(ledger.deployment_id());

        for item in &plan.items {
            let changeset = item.changeset;
            if self.cancel.consume() {
                log::warn!("Update cancelled before {}", changeset.id);
                report.cancelled = true;
                break;
            }

            let verdict = match self.planner.check_preconditions(changeset, db, ledger.snapshot()) {
                Ok(verdict) => verdict,
                Err(err) => return Err(stopped(report, err)),
            };
            match verdict {
                PreconditionVerdict::Run => {}
                PreconditionVerdict::MarkRan(_) => {
                    let entry = ledger.entry_for(changeset, ExecType::MarkRan, Some(0), None);
                    let written = match ledger.record(db, entry) {
                        Ok(written) => written,
                        Err(err) => return Err(stopped(report, err)),
                    };
                    report.push(outcome(
                        changeset,
                        OutcomeStatus::MarkRan,
                        0,
                        Some(written.order_executed),
                        None,
                    ));
                    continue;
                }
                PreconditionVerdict::Skip(_) => {
                    report.push(outcome(changeset, OutcomeStatus::Skipped, 0, None, None));
                    continue;
                }
            }

            log::info!("Running {} ({:?})", changeset.id, item.reason);
            let exec_type = ledger.success_type(&changeset.id);
            let started = Instant::now();

            match self.apply(changeset, exec_type, started, db, ledger) {
                Ok(order) => {
                    let status = match exec_type {
                        ExecType::Reran => OutcomeStatus::Reran,
                        _ => OutcomeStatus::Executed,
                    };
                    report.push(outcome(changeset, status, elapsed_ms(started), Some(order), None));
                }
                Err(err) => {
                    let message = err.to_string();
                    log::error!("Changeset {} failed: {}", changeset.id, message);

                    let entry = ledger.entry_for(
                        changeset,
                        ExecType::Failed,
                        Some(elapsed_ms(started) as i64),
                        Some(message.clone()),
                    );
                    let recorded = ledger.record(db, entry);
                    report.push(outcome(
                        changeset,
                        OutcomeStatus::Failed,
                        elapsed_ms(started),
                        recorded.as_ref().ok().map(|w| w.order_executed),
                        Some(message.clone()),
                    ));
                    if let Err(err) = recorded {
                        log::error!("Could not record failure of {}: {}", changeset.id, err);
                        return Err(stopped(report, err));
                    }

                    if changeset.fail_on_error {
                        let source = Error::ChangeSetExecution {
                            changeset: changeset.id.to_string(),
                            message,
                        };
                        return Err(stopped(report, source));
                    }
                    log::warn!("Continuing past {}: failOnError is false", changeset.id);
                }
            }
        }

        log::info!(
            "Update finished: {} applied, {} failed",
            report.applied_count(),
            report.count(OutcomeStatus::Failed)
        );
        Ok(report)
    }

    /// Execute one changeset and write its ledger row; returns `order_executed`
    ///
    /// On error the transaction (if any) is already rolled back.
    fn apply(
        &self,
        changeset: &ChangeSet,
        exec_type: ExecType,
        started: Instant,
        db: &mut dyn Database,
        ledger: &mut Ledger,
    ) -> Result<i64> {
        let schema = db.default_schema().map(str::to_string);
        let statements = changeset.forward_sql(&SqlContext::new(schema.as_deref(), self.registry))?;
        let in_tx = changeset.run_in_transaction;

        if in_tx {
            db.begin()?;
        }
        let result = (|| -> Result<LedgerEntry> {
            for statement in &statements {
                log::debug!("{}: {}", changeset.id, statement);
                db.execute(statement)?;
            }
            let entry = ledger.entry_for(changeset, exec_type, Some(elapsed_ms(started) as i64), None);
            let written = ledger.write(db, entry)?;
            if in_tx {
                db.commit()?;
            }
            Ok(written)
        })();

        match result {
            Ok(written) => {
                let order = written.order_executed;
                ledger.remember(written);
                Ok(order)
            }
            Err(err) => {
                if in_tx {
                    if let Err(rollback_err) = db.rollback() {
                        log::warn!("Rollback of {} failed: {}", changeset.id, rollback_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Undo applied changesets, given newest first
    ///
    /// All rollback SQL is generated before anything runs, so a changeset
    /// without a usable rollback fails the whole operation up front.
    pub fn rollback(
        &self,
        targets: &[&ChangeSet],
        db: &mut dyn Database,
        ledger: &mut Ledger,
    ) -> Result<ExecutionReport> {
        let schema = db.default_schema().map(str::to_string);
        let ctx = SqlContext::new(schema.as_deref(), self.registry);

        let mut work = Vec::with_capacity(targets.len());
        for &changeset in targets {
            let mark_ran = ledger
                .snapshot()
                .current(&changeset.id)
                .is_some_and(|e| e.exec_type == ExecType::MarkRan);
            let statements = if mark_ran {
                // Never executed, nothing to undo
                Vec::new()
            } else {
                changeset.rollback_sql(&ctx)?
            };
            work.push((changeset, statements));
        }

        let mut report = ExecutionReport::new(ledger.deployment_id());
        for (changeset, statements) in work {
            if self.cancel.consume() {
                log::warn!("Rollback cancelled before {}", changeset.id);
                report.cancelled = true;
                break;
            }

            log::info!("Rolling back {}", changeset.id);
            let started = Instant::now();
            let result = (|| -> Result<LedgerEntry> {
                db.begin()?;
                for statement in &statements {
                    db.execute(statement)?;
                }
                let entry = ledger.entry_for(
                    changeset,
                    ExecType::RolledBack,
                    Some(elapsed_ms(started) as i64),
                    None,
                );
                let written = ledger.write(db, entry)?;
                db.commit()?;
                Ok(written)
            })();

            match result {
                Ok(written) => {
                    let order = written.order_executed;
                    ledger.remember(written);
                    report.push(outcome(
                        changeset,
                        OutcomeStatus::RolledBack,
                        elapsed_ms(started),
                        Some(order),
                        None,
                    ));
                }
                Err(err) => {
                    if let Err(rollback_err) = db.rollback() {
                        log::warn!("Rollback of {} failed: {}", changeset.id, rollback_err);
                    }
                    let message = err.to_string();
                    report.push(outcome(
                        changeset,
                        OutcomeStatus::Failed,
                        elapsed_ms(started),
                        None,
                        Some(message.clone()),
                    ));
                    let source = Error::Rollback(format!(
                        "{} could not be rolled back: {}",
                        changeset.id, message
                    ));
                    return Err(stopped(report, source));
                }
            }
        }
        Ok(report)
    }

    /// SQL an update would run, without executing or recording anything
    pub fn preview(&self, plan: &ExecutionPlan<'_>, default_schema: Option<&str>) -> Result<String> {
        let ctx = SqlContext::new(default_schema, self.registry);
        let mut out = String::new();
        for item in &plan.items {
            let changeset = item.changeset;
            out.push_str(&format!("-- Changeset {} ({:?})\n", changeset.id, item.reason));
            if changeset.preconditions.is_some() {
                out.push_str("-- Preconditions are evaluated at run time\n");
            }
            for statement in changeset.forward_sql(&ctx)? {
                out.push_str(statement.trim_end_matches(';'));
                out.push_str(";\n");
            }
            out.push('\n');
        }
        Ok(out)
    }
}

/// Stop a run, keeping what it did so far
fn stopped(report: ExecutionReport, source: Error) -> Error {
    Error::MigrationFailure {
        source: Box::new(source),
        report: Box::new(report),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn outcome(
    changeset: &ChangeSet,
    status: OutcomeStatus,
    duration_ms: u64,
    order_executed: Option<i64>,
    error: Option<String>,
) -> ChangeSetOutcome {
    ChangeSetOutcome {
        changeset: changeset.id.clone(),
        status,
        duration_ms,
        order_executed,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DuckDbDatabase;
    use crate::domain::{Change, ChangeSetId, Expression, LockRecord, NewLedgerEntry};
    use crate::ports::SchemaObject;
    use crate::services::ledger::Ledger;

    fn changeset(id: &str, sql: &str) -> ChangeSet {
        let changes = vec![Change::Sql {
            sql: sql.to_string(),
            comment: None,
        }];
        ChangeSet {
            id: ChangeSetId::new(id, "alice", "main.json"),
            checksum: crate::domain::checksum::compute(&changes),
            changes,
            rollback: Vec::new(),
            context: Expression::Always,
            labels: Expression::Always,
            run_always: false,
            run_on_change: false,
            fail_on_error: true,
            run_in_transaction: true,
            preconditions: None,
            valid_checksums: Vec::new(),
            comment: None,
        }
    }

    fn setup() -> (DuckDbDatabase, ChangeRegistry, ExecutionPlanner) {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        Ledger::ensure_table(&mut db).unwrap();
        (db, ChangeRegistry::new(), ExecutionPlanner::default())
    }

    #[test]
    fn test_failure_rolls_back_and_records() {
        let (mut db, registry, planner) = setup();
        let all = vec![
            changeset("1", "CREATE TABLE a (id INTEGER)"),
            changeset("2", "CREATE TABLE b (id INTEGER); INSERT INTO nope VALUES (1)"),
            changeset("3", "CREATE TABLE c (id INTEGER)"),
        ];
        let mut ledger = Ledger::load(&mut db, "d1").unwrap();
        let plan = planner.plan(&all, ledger.snapshot()).unwrap();

        let err = Executor::new(&planner, &registry)
            .run(&plan, &mut db, &mut ledger)
            .unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.count(OutcomeStatus::Failed), 1);

        // Changeset 2 left nothing behind, changeset 3 never ran
        assert!(db.table_exists(None, "a").unwrap());
        assert!(!db.table_exists(None, "b").unwrap());
        assert!(!db.table_exists(None, "c").unwrap());

        let rows = db.read_ledger().unwrap();
        let types: Vec<ExecType> = rows.iter().map(|r| r.exec_type).collect();
        assert_eq!(types, vec![ExecType::Executed, ExecType::Failed]);
        assert!(rows[1].error_message.as_deref().unwrap_or("").contains("nope"));
    }

    #[test]
    fn test_fail_on_error_false_continues() {
        let (mut db, registry, planner) = setup();
        let mut bad = changeset("1", "INSERT INTO nope VALUES (1)");
        bad.fail_on_error = false;
        let all = vec![bad, changeset("2", "CREATE TABLE ok (id INTEGER)")];
        let mut ledger = Ledger::load(&mut db, "d1").unwrap();
        let plan = planner.plan(&all, ledger.snapshot()).unwrap();

        let report = Executor::new(&planner, &registry)
            .run(&plan, &mut db, &mut ledger)
            .unwrap();
        assert_eq!(report.count(OutcomeStatus::Failed), 1);
        assert_eq!(report.applied_count(), 1);
        assert!(report.first_error.is_some());
        assert!(!report.is_success());
    }

    /// DuckDB connection that counts transaction calls
    struct Counting {
        inner: DuckDbDatabase,
        begins: usize,
        commits: usize,
        rollbacks: usize,
    }

    impl Database for Counting {
        fn default_schema(&self) -> Option<&str> {
            self.inner.default_schema()
        }
        fn set_default_schema(&mut self, schema: &str) -> Result<()> {
            self.inner.set_default_schema(schema)
        }
        fn execute(&mut self, sql: &str) -> Result<()> {
            self.inner.execute(sql)
        }
        fn begin(&mut self) -> Result<()> {
            self.begins += 1;
            self.inner.begin()
        }
        fn commit(&mut self) -> Result<()> {
            self.commits += 1;
            self.inner.commit()
        }
        fn rollback(&mut self) -> Result<()> {
            self.rollbacks += 1;
            self.inner.rollback()
        }
        fn query_scalar(&mut self, sql: &str) -> Result<Option<String>> {
            self.inner.query_scalar(sql)
        }
        fn table_exists(&mut self, schema: Option<&str>, table: &str) -> Result<bool> {
            self.inner.table_exists(schema, table)
        }
        fn column_exists(&mut self, schema: Option<&str>, table: &str, column: &str) -> Result<bool> {
            self.inner.column_exists(schema, table, column)
        }
        fn view_exists(&mut self, schema: Option<&str>, view: &str) -> Result<bool> {
            self.inner.view_exists(schema, view)
        }
        fn list_objects(&mut self) -> Result<Vec<SchemaObject>> {
            self.inner.list_objects()
        }
        fn ensure_ledger_table(&mut self) -> Result<()> {
            self.inner.ensure_ledger_table()
        }
        fn read_ledger(&mut self) -> Result<Vec<LedgerEntry>> {
            self.inner.read_ledger()
        }
        fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
            self.inner.insert_ledger_entry(entry)
        }
        fn ensure_lock_table(&mut self) -> Result<()> {
            self.inner.ensure_lock_table()
        }
        fn try_insert_lock(&mut self, holder: &str) -> Result<bool> {
            self.inner.try_insert_lock(holder)
        }
        fn delete_lock(&mut self, holder: Option<&str>) -> Result<bool> {
            self.inner.delete_lock(holder)
        }
        fn read_lock(&mut self) -> Result<Option<LockRecord>> {
            self.inner.read_lock()
        }
    }

    #[test]
    fn test_outside_transaction_never_begins_or_rolls_back() {
        let (db, registry, planner) = setup();
        let mut db = Counting {
            inner: db,
            begins: 0,
            commits: 0,
            rollbacks: 0,
        };
        let mut plain = changeset("1", "CREATE TABLE a (id INTEGER)");
        plain.run_in_transaction = false;
        let mut broken = changeset("2", "INSERT INTO nope VALUES (1)");
        broken.run_in_transaction = false;
        let all = vec![plain, broken];

        let mut ledger = Ledger::load(&mut db, "d1").unwrap();
        let plan = planner.plan(&all, ledger.snapshot()).unwrap();
        let err = Executor::new(&planner, &registry)
            .run(&plan, &mut db, &mut ledger)
            .unwrap_err();

        assert_eq!(err.report().unwrap().applied_count(), 1);
        assert_eq!((db.begins, db.commits, db.rollbacks), (0, 0, 0));

        let types: Vec<ExecType> = db.read_ledger().unwrap().iter().map(|r| r.exec_type).collect();
        assert_eq!(types, vec![ExecType::Executed, ExecType::Failed]);
        assert!(db.table_exists(None, "a").unwrap());
    }

    #[test]
    fn test_failure_inside_transaction_rolls_back_once() {
        let (db, registry, planner) = setup();
        let mut db = Counting {
            inner: db,
            begins: 0,
            commits: 0,
            rollbacks: 0,
        };
        let all = vec![
            changeset("1", "CREATE TABLE a (id INTEGER)"),
            changeset("2", "INSERT INTO nope VALUES (1)"),
        ];

        let mut ledger = Ledger::load(&mut db, "d1").unwrap();
        let plan = planner.plan(&all, ledger.snapshot()).unwrap();
        assert!(Executor::new(&planner, &registry)
            .run(&plan, &mut db, &mut ledger)
            .is_err());
        assert_eq!((db.begins, db.commits, db.rollbacks), (2, 1, 1));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (mut db, registry, planner) = setup();
        let all = vec![changeset("1", "CREATE TABLE a (id INTEGER)")];
        let mut ledger = Ledger::load(&mut db, "d1").unwrap();
        let plan = planner.plan(&all, ledger.snapshot()).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let report = Executor::new(&planner, &registry)
            .with_cancel_token(token.clone())
            .run(&plan, &mut db, &mut ledger)
            .unwrap();
        assert!(report.cancelled);
        assert!(report.outcomes.is_empty());
        assert!(db.read_ledger().unwrap().is_empty());

        // The request was used up; the same token lets the next run through
        assert!(!token.is_cancelled());
        let report = Executor::new(&planner, &registry)
            .with_cancel_token(token)
            .run(&plan, &mut db, &mut ledger)
            .unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.applied_count(), 1);
    }

    #[test]
    fn test_rollback_requires_sql_for_every_target() {
        let (mut db, registry, planner) = setup();
        let mut with_rollback = changeset("1", "CREATE TABLE a (id INTEGER)");
        with_rollback.rollback = vec![Change::Sql {
            sql: "DROP TABLE a".to_string(),
            comment: None,
        }];
        let without = changeset("2", "CREATE TABLE b (id INTEGER)");
        let all = vec![with_rollback, without];

        let mut ledger = Ledger::load(&mut db, "d1").unwrap();
        let plan = planner.plan(&all, ledger.snapshot()).unwrap();
        let executor = Executor::new(&planner, &registry);
        executor.run(&plan, &mut db, &mut ledger).unwrap();

        let err = executor
            .rollback(&[&all[1], &all[0]], &mut db, &mut ledger)
            .unwrap_err();
        assert!(matches!(err, Error::Rollback(_)));
        assert!(db.table_exists(None, "a").unwrap());

        let report = executor.rollback(&[&all[0]], &mut db, &mut ledger).unwrap();
        assert_eq!(report.count(OutcomeStatus::RolledBack), 1);
        assert!(!db.table_exists(None, "a").unwrap());
        assert!(!ledger.is_applied(&all[0].id));
    }

    #[test]
    fn test_preview_lists_statements() {
        let (_db, registry, planner) = setup();
        let all = vec![changeset("1", "CREATE TABLE a (id INTEGER);")];
        let ledger = crate::services::ledger::LedgerSnapshot::default();
        let plan = planner.plan(&all, &ledger).unwrap();

        let sql = Executor::new(&planner, &registry).preview(&plan, None).unwrap();
        assert!(sql.contains("-- Changeset main.json::1::alice (New)"));
        assert!(sql.contains("CREATE TABLE a (id INTEGER);\n"));
    }
}
