//! End-to-end properties of update, rollback and drop-all
//!
//! Every test runs the facade against a real in-memory DuckDB and checks
//! the ledger it leaves behind.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use changeline_core::domain::{ExecType, LedgerEntry};
use changeline_core::ports::Database;
use changeline_core::{
    ChangeSetRef, DuckDbDatabase, Error, MemoryAccessor, MigrationFacade, MigrationSettings,
    OutcomeStatus, Selection,
};

const CHANGELOG: &str = "db/changelog.json";

fn changelog(changesets: Vec<Value>) -> String {
    let entries: Vec<Value> = changesets
        .into_iter()
        .map(|c| json!({ "changeSet": c }))
        .collect();
    json!({ "databaseChangeLog": entries }).to_string()
}

fn sql_changeset(id: &str, sql: &str) -> Value {
    json!({ "id": id, "author": "test", "changes": [{ "sql": { "sql": sql } }] })
}

fn table_changeset(id: &str, table: &str) -> Value {
    json!({
        "id": id,
        "author": "test",
        "changes": [{ "createTable": {
            "tableName": table,
            "columns": [{ "name": "id", "type": "INTEGER" }]
        }}]
    })
}

fn facade_on(db: Box<dyn Database>, changesets: Vec<Value>) -> MigrationFacade {
    let accessor = MemoryAccessor::new().with(CHANGELOG, changelog(changesets));
    let settings = MigrationSettings {
        lock_timeout: Duration::from_millis(200),
        lock_poll_interval: Duration::from_millis(10),
        ..MigrationSettings::new(CHANGELOG)
    };
    MigrationFacade::new(db, Arc::new(accessor), settings)
}

fn new_facade(changesets: Vec<Value>) -> MigrationFacade {
    facade_on(Box::new(DuckDbDatabase::open_in_memory().unwrap()), changesets)
}

fn all() -> Selection {
    Selection::default()
}

fn ledger(facade: &mut MigrationFacade) -> Vec<LedgerEntry> {
    facade.database().read_ledger().unwrap()
}

fn table_exists(facade: &mut MigrationFacade, table: &str) -> bool {
    facade.database().table_exists(None, table).unwrap()
}

#[test]
fn test_update_is_idempotent() {
    let mut facade = new_facade(vec![
        table_changeset("1", "users"),
        table_changeset("2", "orders"),
    ]);

    let first = facade.update(&all(), &all()).unwrap();
    assert_eq!(first.applied_count(), 2);
    let rows = ledger(&mut facade).len();

    let second = facade.update(&all(), &all()).unwrap();
    assert!(second.outcomes.is_empty());
    assert!(second.is_success());
    assert_eq!(ledger(&mut facade).len(), rows);
    assert!(facade.status(&all(), &all()).unwrap().is_up_to_date());
}

#[test]
fn test_failure_stops_run_and_is_recorded() {
    let mut facade = new_facade(vec![
        table_changeset("1", "a"),
        table_changeset("2", "b"),
        sql_changeset("3", "CREATE TABLE a (id INTEGER)"),
        table_changeset("4", "d"),
    ]);

    let err = facade.update(&all(), &all()).unwrap_err();
    let report = err.report().expect("partial report");
    let statuses: Vec<OutcomeStatus> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![OutcomeStatus::Executed, OutcomeStatus::Executed, OutcomeStatus::Failed]
    );
    assert!(report.first_error.as_deref().unwrap().contains("::3::test"));
    assert!(matches!(err, Error::MigrationFailure { .. }));

    let rows = ledger(&mut facade);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].exec_type, ExecType::Failed);
    assert!(rows[2].error_message.is_some());
    assert!(!table_exists(&mut facade, "d"));

    // The lock is released on the failure path
    assert!(!facade.list_locks().unwrap().locked);
}

#[test]
fn test_resumes_after_fix_with_increasing_order() {
    let db = DuckDbDatabase::open_in_memory().unwrap();
    let mut facade = facade_on(
        Box::new(db),
        vec![
            table_changeset("1", "a"),
            sql_changeset("2", "CREATE TABLE a (id INTEGER)"),
            table_changeset("3", "c"),
        ],
    );
    assert!(facade.update(&all(), &all()).is_err());
    let failed_order = ledger(&mut facade)[1].order_executed;

    let mut facade = facade_on(
        facade.into_database(),
        vec![
            table_changeset("1", "a"),
            sql_changeset("2", "CREATE TABLE b (id INTEGER)"),
            table_changeset("3", "c"),
        ],
    );
    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.applied_count(), 2);

    let orders: Vec<i64> = report.outcomes.iter().filter_map(|o| o.order_executed).collect();
    assert_eq!(orders.len(), 2);
    assert!(orders[0] > failed_order);
    assert!(orders[1] > orders[0]);
    assert!(table_exists(&mut facade, "b"));
    assert!(table_exists(&mut facade, "c"));
}

#[test]
fn test_checksum_mismatch_leaves_ledger_unchanged() {
    let mut facade = new_facade(vec![table_changeset("1", "users")]);
    facade.update(&all(), &all()).unwrap();
    let before = ledger(&mut facade);

    let mut facade = facade_on(
        facade.into_database(),
        vec![
            sql_changeset("1", "CREATE TABLE users (id BIGINT)"),
            table_changeset("2", "orders"),
        ],
    );
    let err = facade.update(&all(), &all()).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    assert_eq!(ledger(&mut facade), before);
    assert!(!table_exists(&mut facade, "orders"));

    let validation = facade.validate().unwrap();
    assert!(!validation.is_valid());
    assert_eq!(validation.checksum_errors.len(), 1);
}

#[test]
fn test_valid_checksum_accepts_modified_changeset() {
    let mut facade = new_facade(vec![table_changeset("1", "users")]);
    facade.update(&all(), &all()).unwrap();

    let mut modified = sql_changeset("1", "CREATE TABLE users (id BIGINT)");
    modified["validCheckSum"] = json!(["ANY"]);
    let mut facade = facade_on(facade.into_database(), vec![modified]);
    let report = facade.update(&all(), &all()).unwrap();
    assert!(report.outcomes.is_empty());
}

#[test]
fn test_run_on_change_records_reran() {
    let view = |sql: &str| {
        let mut c = sql_changeset("v", sql);
        c["runOnChange"] = json!(true);
        c
    };
    let mut facade = new_facade(vec![view("CREATE OR REPLACE VIEW v AS SELECT 1 AS x")]);
    facade.update(&all(), &all()).unwrap();

    // Unchanged: nothing to do
    let mut facade = facade_on(
        facade.into_database(),
        vec![view("CREATE OR REPLACE VIEW v AS SELECT 1 AS x")],
    );
    assert!(facade.update(&all(), &all()).unwrap().outcomes.is_empty());

    let mut facade = facade_on(
        facade.into_database(),
        vec![view("CREATE OR REPLACE VIEW v AS SELECT 2 AS x")],
    );
    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.count(OutcomeStatus::Reran), 1);

    let rows = ledger(&mut facade);
    assert_eq!(rows.last().unwrap().exec_type, ExecType::Reran);
    assert_eq!(
        facade.database().query_scalar("SELECT x FROM v").unwrap().as_deref(),
        Some("2")
    );
}

#[test]
fn test_fixed_rerun_after_failure_records_reran() {
    let view = |sql: &str| {
        let mut c = sql_changeset("v", sql);
        c["runOnChange"] = json!(true);
        c
    };
    let mut facade = new_facade(vec![view("CREATE OR REPLACE VIEW v AS SELECT 1 AS x")]);
    facade.update(&all(), &all()).unwrap();

    let mut facade = facade_on(
        facade.into_database(),
        vec![view("CREATE OR REPLACE VIEW v AS SELECT x FROM missing")],
    );
    assert!(facade.update(&all(), &all()).is_err());

    let mut facade = facade_on(
        facade.into_database(),
        vec![view("CREATE OR REPLACE VIEW v AS SELECT 3 AS x")],
    );
    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.count(OutcomeStatus::Reran), 1);
    assert_eq!(report.count(OutcomeStatus::Executed), 0);

    let types: Vec<ExecType> = ledger(&mut facade).iter().map(|e| e.exec_type).collect();
    assert_eq!(types, vec![ExecType::Executed, ExecType::Failed, ExecType::Reran]);
}

#[test]
fn test_rolled_back_changeset_executes_again() {
    let mut facade = new_facade(vec![table_changeset("1", "users")]);
    facade.update(&all(), &all()).unwrap();
    facade.rollback_count(1).unwrap();

    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.count(OutcomeStatus::Executed), 1);
    let types: Vec<ExecType> = ledger(&mut facade).iter().map(|e| e.exec_type).collect();
    assert_eq!(
        types,
        vec![ExecType::Executed, ExecType::RolledBack, ExecType::Executed]
    );
}

#[test]
fn test_non_transactional_changesets() {
    let mut outside = sql_changeset("1", "CREATE TABLE plain (id INTEGER)");
    outside["runInTransaction"] = json!(false);
    let partial = json!({
        "id": "2",
        "author": "test",
        "runInTransaction": false,
        "changes": [
            { "sql": { "sql": "CREATE TABLE half (id INTEGER)" } },
            { "sql": { "sql": "INSERT INTO nowhere VALUES (1)" } }
        ]
    });
    let mut facade = new_facade(vec![outside, partial]);

    let err = facade.update(&all(), &all()).unwrap_err();
    let report = err.report().unwrap();
    assert_eq!(report.count(OutcomeStatus::Executed), 1);
    assert_eq!(report.count(OutcomeStatus::Failed), 1);

    // Without a transaction the first statement of the failed changeset stays
    assert!(table_exists(&mut facade, "plain"));
    assert!(table_exists(&mut facade, "half"));

    let rows = ledger(&mut facade);
    let types: Vec<ExecType> = rows.iter().map(|e| e.exec_type).collect();
    assert_eq!(types, vec![ExecType::Executed, ExecType::Failed]);
    assert!(rows[1].error_message.as_deref().unwrap_or("").contains("nowhere"));
}

#[test]
fn test_cancel_stops_one_update_only() {
    let mut facade = new_facade(vec![table_changeset("1", "a"), table_changeset("2", "b")]);
    let token = facade.cancel_token();

    token.cancel();
    let cancelled = facade.update(&all(), &all()).unwrap();
    assert!(cancelled.cancelled);
    assert!(cancelled.outcomes.is_empty());
    assert!(!token.is_cancelled());
    assert!(ledger(&mut facade).is_empty());

    let report = facade.update(&all(), &all()).unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.applied_count(), 2);
}

#[test]
fn test_run_always_runs_every_time() {
    let mut counter = sql_changeset("count", "INSERT INTO runs VALUES (1)");
    counter["runAlways"] = json!(true);
    let mut facade = new_facade(vec![
        sql_changeset("runs", "CREATE TABLE runs (n INTEGER)"),
        counter,
    ]);

    facade.update(&all(), &all()).unwrap();
    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.count(OutcomeStatus::Reran), 1);
    assert_eq!(
        facade
            .database()
            .query_scalar("SELECT COUNT(*) FROM runs")
            .unwrap()
            .as_deref(),
        Some("2")
    );
}

#[test]
fn test_context_filtering_keeps_declaration_order() {
    let with_context = |id: &str, table: &str, context: &str| {
        let mut c = table_changeset(id, table);
        c["context"] = json!(context);
        c
    };
    let mut facade = new_facade(vec![
        with_context("1", "dev_only", "dev"),
        table_changeset("2", "always"),
        with_context("3", "prod_only", "prod"),
        with_context("4", "not_test", "!test"),
    ]);

    let report = facade.update(&Selection::parse("dev"), &all()).unwrap();
    let ids: Vec<&str> = report.outcomes.iter().map(|o| o.changeset.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "4"]);
    assert!(!table_exists(&mut facade, "prod_only"));

    let status = facade.status(&Selection::parse("prod"), &all()).unwrap();
    let pending: Vec<&str> = status.pending.iter().map(|p| p.changeset.id.as_str()).collect();
    assert_eq!(pending, vec!["3"]);
}

#[test]
fn test_fail_on_error_false_continues() {
    let mut broken = sql_changeset("2", "INSERT INTO missing VALUES (1)");
    broken["failOnError"] = json!(false);
    let mut facade = new_facade(vec![table_changeset("1", "a"), broken, table_changeset("3", "c")]);

    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.count(OutcomeStatus::Failed), 1);
    assert_eq!(report.applied_count(), 2);
    assert!(!report.is_success());
    assert!(table_exists(&mut facade, "c"));
}

#[test]
fn test_precondition_mark_ran_and_halt() {
    let mut guarded = table_changeset("1", "legacy");
    guarded["preConditions"] = json!({
        "onFail": "MARK_RAN",
        "not": [{ "tableExists": { "tableName": "existing" } }]
    });
    let db = DuckDbDatabase::open_in_memory().unwrap();
    let mut facade = facade_on(Box::new(db), vec![guarded.clone()]);
    facade.database().execute("CREATE TABLE existing (id INTEGER)").unwrap();

    let report = facade.update(&all(), &all()).unwrap();
    assert_eq!(report.count(OutcomeStatus::MarkRan), 1);
    assert!(!table_exists(&mut facade, "legacy"));
    assert_eq!(ledger(&mut facade)[0].exec_type, ExecType::MarkRan);
    assert!(facade.update(&all(), &all()).unwrap().outcomes.is_empty());

    let mut halting = table_changeset("2", "needs_users");
    halting["preConditions"] = json!({
        "onFail": "HALT",
        "onFailMessage": "users must exist first",
        "tableExists": { "tableName": "users" }
    });
    let mut facade = facade_on(facade.into_database(), vec![guarded, halting]);
    let err = facade.update(&all(), &all()).unwrap_err();
    match err.root_cause() {
        Error::Precondition { message, .. } => assert_eq!(message, "users must exist first"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.report().unwrap().outcomes.is_empty());
    assert_eq!(ledger(&mut facade).len(), 1);
}

#[test]
fn test_precondition_error_keeps_partial_report() {
    let mut broken = table_changeset("2", "two");
    broken["preConditions"] = json!({
        "onFail": "HALT",
        "sqlCheck": { "expectedResult": "0", "sql": "SELECT count(*) FROM no_such_table" }
    });
    let mut facade = new_facade(vec![table_changeset("1", "one"), broken]);

    let err = facade.update(&all(), &all()).unwrap_err();
    assert!(matches!(err, Error::MigrationFailure { .. }));
    assert!(!matches!(err.root_cause(), Error::Precondition { .. }));

    let report = err.report().unwrap();
    assert_eq!(report.applied_count(), 1);
    assert_eq!(report.outcomes[0].changeset.id, "1");
    assert!(table_exists(&mut facade, "one"));
    assert!(!table_exists(&mut facade, "two"));
    assert_eq!(ledger(&mut facade).len(), 1);
}

#[test]
fn test_rollback_count_and_target() {
    let changesets = vec![
        table_changeset("1", "one"),
        table_changeset("2", "two"),
        table_changeset("3", "three"),
    ];
    let mut facade = new_facade(changesets);
    facade.update(&all(), &all()).unwrap();

    let report = facade.rollback_count(1).unwrap();
    assert_eq!(report.count(OutcomeStatus::RolledBack), 1);
    assert!(!table_exists(&mut facade, "three"));
    assert_eq!(ledger(&mut facade).last().unwrap().exec_type, ExecType::RolledBack);

    let report = facade.rollback(&ChangeSetRef::parse("1")).unwrap();
    let ids: Vec<&str> = report.outcomes.iter().map(|o| o.changeset.id.as_str()).collect();
    assert_eq!(ids, vec!["2"]);
    assert!(table_exists(&mut facade, "one"));
    assert!(!table_exists(&mut facade, "two"));

    let status = facade.status(&all(), &all()).unwrap();
    assert_eq!(status.applied.len(), 1);
    assert_eq!(status.pending.len(), 2);

    // Rolled-back changesets are new again
    assert_eq!(facade.update(&all(), &all()).unwrap().applied_count(), 2);
}

#[test]
fn test_rollback_of_unapplied_target_fails() {
    let mut facade = new_facade(vec![table_changeset("1", "one"), table_changeset("2", "two")]);
    facade.update(&all(), &all()).unwrap();
    facade.rollback_count(1).unwrap();

    let err = facade.rollback(&ChangeSetRef::parse("2")).unwrap_err();
    assert!(matches!(err, Error::Rollback(_)));
}

#[test]
fn test_rollback_without_inverse_fails_before_running() {
    let mut facade = new_facade(vec![
        table_changeset("1", "one"),
        sql_changeset("2", "INSERT INTO one VALUES (1)"),
    ]);
    facade.update(&all(), &all()).unwrap();
    let before = ledger(&mut facade);

    let err = facade.rollback_count(2).unwrap_err();
    assert!(matches!(err, Error::Rollback(_)));
    assert_eq!(ledger(&mut facade), before);
    assert!(table_exists(&mut facade, "one"));
}

#[test]
fn test_drop_all_removes_schema_and_ledger() {
    let mut facade = new_facade(vec![
        table_changeset("1", "users"),
        sql_changeset("2", "CREATE VIEW user_ids AS SELECT id FROM users"),
        sql_changeset("3", "CREATE SEQUENCE user_seq"),
    ]);
    facade.update(&all(), &all()).unwrap();

    let report = facade.drop_all().unwrap();
    assert!(report.dropped.len() >= 4);
    assert!(!table_exists(&mut facade, "users"));
    assert!(ledger(&mut facade).is_empty());
    assert!(!facade.list_locks().unwrap().locked);

    let status = facade.status(&all(), &all()).unwrap();
    assert_eq!(status.pending.len(), 3);
}

#[test]
fn test_update_sql_does_not_apply() {
    let mut facade = new_facade(vec![table_changeset("1", "users")]);
    let sql = facade.update_sql(&all(), &all()).unwrap();
    assert!(sql.contains("-- Changeset db/changelog.json::1::test"));
    assert!(sql.contains("CREATE TABLE"));
    assert!(!table_exists(&mut facade, "users"));
    assert!(ledger(&mut facade).is_empty());
}

#[test]
fn test_held_lock_times_out_without_touching_ledger() {
    let mut facade = new_facade(vec![table_changeset("1", "users")]);
    facade.database().ensure_lock_table().unwrap();
    assert!(facade.database().try_insert_lock("deploy-box:99:abcdef12").unwrap());

    let err = facade.update(&all(), &all()).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(!facade.database().table_exists(None, "changeline_ledger").unwrap());

    assert!(facade.force_release_locks().unwrap());
    assert_eq!(facade.update(&all(), &all()).unwrap().applied_count(), 1);
}

#[test]
fn test_status_reports_unknown_changesets() {
    let mut facade = new_facade(vec![table_changeset("1", "one"), table_changeset("2", "two")]);
    facade.update(&all(), &all()).unwrap();

    let mut facade = facade_on(facade.into_database(), vec![table_changeset("1", "one")]);
    let status = facade.status(&all(), &all()).unwrap();
    assert_eq!(status.unknown.len(), 1);
    assert_eq!(status.unknown[0].id, "2");
}
