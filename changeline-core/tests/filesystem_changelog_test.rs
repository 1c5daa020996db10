//! Changelogs read from disk: includes, includeAll, sqlFile and parameters

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use changeline_core::ports::Database;
use changeline_core::{
    DuckDbDatabase, FileSystemAccessor, MigrationFacade, MigrationSettings, Selection,
};

fn write(root: &Path, path: &str, contents: &str) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, contents).unwrap();
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "db/changelog.json",
        r#"{"databaseChangeLog": [
            {"property": {"name": "table_prefix", "value": "app_"}},
            {"include": {"file": "base.json", "relativeToChangelogFile": true}},
            {"includeAll": {"path": "db/features/"}}
        ]}"#,
    );
    write(
        root,
        "db/base.json",
        r#"{"databaseChangeLog": [
            {"changeSet": {"id": "base-1", "author": "ops", "changes": [
                {"sqlFile": {"path": "sql/users.sql", "relativeToChangelogFile": true}}
            ]}}
        ]}"#,
    );
    write(
        root,
        "db/sql/users.sql",
        "CREATE TABLE ${table_prefix}users (id INTEGER, region VARCHAR DEFAULT '${region:eu}')",
    );
    write(
        root,
        "db/features/002-orders.json",
        r#"{"databaseChangeLog": [
            {"changeSet": {"id": "orders", "author": "dev", "changes": [
                {"createTable": {"tableName": "${table_prefix}orders",
                 "columns": [{"name": "id", "type": "INTEGER"}]}}
            ]}}
        ]}"#,
    );
    write(
        root,
        "db/features/001-audit.json",
        r#"{"databaseChangeLog": [
            {"changeSet": {"id": "audit", "author": "dev", "changes": [
                {"sql": {"sql": "CREATE TABLE audit (id INTEGER)"}}
            ]}}
        ]}"#,
    );
    write(root, "db/features/notes.txt", "not a changelog");
    dir
}

fn facade(root: &Path, parameters: BTreeMap<String, String>) -> MigrationFacade {
    let settings = MigrationSettings {
        parameters,
        ..MigrationSettings::new("db/changelog.json")
    };
    MigrationFacade::new(
        Box::new(DuckDbDatabase::open_in_memory().unwrap()),
        Arc::new(FileSystemAccessor::new(root)),
        settings,
    )
}

#[test]
fn test_changelog_tree_is_applied_in_order() {
    let dir = project();
    let mut facade = facade(dir.path(), BTreeMap::new());

    let changesets = facade.changesets().unwrap();
    let ids: Vec<String> = changesets.iter().map(|c| c.id.to_string()).collect();
    assert_eq!(
        ids,
        vec![
            "db/base.json::base-1::ops",
            "db/features/001-audit.json::audit::dev",
            "db/features/002-orders.json::orders::dev",
        ]
    );

    let report = facade.update(&Selection::default(), &Selection::default()).unwrap();
    assert_eq!(report.applied_count(), 3);

    let db = facade.database();
    assert!(db.table_exists(None, "app_users").unwrap());
    assert!(db.table_exists(None, "app_orders").unwrap());
    assert!(db.table_exists(None, "audit").unwrap());
    assert!(db.column_exists(None, "app_users", "region").unwrap());
}

#[test]
fn test_caller_parameters_take_precedence() {
    let dir = project();
    let parameters: BTreeMap<String, String> = [("table_prefix".to_string(), "x_".to_string())]
        .into_iter()
        .collect();
    let mut facade = facade(dir.path(), parameters);

    facade.update(&Selection::default(), &Selection::default()).unwrap();
    assert!(facade.database().table_exists(None, "x_users").unwrap());
    assert!(!facade.database().table_exists(None, "app_users").unwrap());
}

#[test]
fn test_editing_sql_file_changes_checksum() {
    let dir = project();
    let mut first = facade(dir.path(), BTreeMap::new());
    let before = first.changesets().unwrap()[0].checksum.clone();

    write(dir.path(), "db/sql/users.sql", "CREATE TABLE ${table_prefix}users (id BIGINT)");
    let second = facade(dir.path(), BTreeMap::new());
    let after = second.changesets().unwrap()[0].checksum.clone();

    assert_ne!(before, after);
    assert!(first.validate().unwrap().is_valid());
}
