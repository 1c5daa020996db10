//! Migration facade - the entry point for every engine operation
//!
//! Operations that read or change migration state take the migration lock
//! first and release it on every exit path. The lock is taken before the
//! changelog is parsed or the ledger read.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::domain::change::quote_ident;
use crate::domain::result::{Error, Result};
use crate::domain::{
    ChangeRegistry, ChangeSet, ChangeSetId, ChangeSetRef, DropReport, ExecutionReport,
    LockStatus, PendingChangeSet, Selection, SqlContext, StatusReport, ValidationReport,
    LOCK_TABLE,
};
use crate::ports::{Database, ResourceAccessor, SchemaObject};
use crate::services::ledger::{Ledger, LedgerSnapshot};
use crate::services::lock::LockManager;
use crate::services::parser::ChangeLogParser;
use crate::services::planner::{self, ExecutionPlanner};
use crate::services::syntax::check_sql_syntax;
use crate::services::{CancelToken, Executor};

/// What to migrate and how long to wait for the lock
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Root changelog path, as understood by the resource accessor
    pub changelog: String,
    pub parameters: BTreeMap<String, String>,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            changelog: "changelog.json".to_string(),
            parameters: BTreeMap::new(),
            lock_timeout: Duration::from_secs(300),
            lock_poll_interval: Duration::from_secs(1),
        }
    }
}

impl MigrationSettings {
    pub fn new(changelog: impl Into<String>) -> Self {
        Self {
            changelog: changelog.into(),
            ..Self::default()
        }
    }
}

/// Runs migration operations against one database connection
pub struct MigrationFacade {
    db: Box<dyn Database>,
    accessor: Arc<dyn ResourceAccessor>,
    settings: MigrationSettings,
    registry: ChangeRegistry,
    lock: LockManager,
    cancel: CancelToken,
}

impl MigrationFacade {
    pub fn new(
        db: Box<dyn Database>,
        accessor: Arc<dyn ResourceAccessor>,
        settings: MigrationSettings,
    ) -> Self {
        let lock = LockManager::new(settings.lock_timeout, settings.lock_poll_interval);
        Self {
            db,
            accessor,
            settings,
            registry: ChangeRegistry::new(),
            lock,
            cancel: CancelToken::new(),
        }
    }

    /// Generators for `custom` changes
    pub fn with_registry(mut self, registry: ChangeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Token that stops a running update or rollback between changesets
    ///
    /// A request stops the first operation that reaches a changeset after
    /// it; later operations on this facade run normally.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    pub fn database(&mut self) -> &mut dyn Database {
        self.db.as_mut()
    }

    pub fn into_database(self) -> Box<dyn Database> {
        self.db
    }

    /// Parse the configured changelog without touching the database
    pub fn changesets(&self) -> Result<Vec<ChangeSet>> {
        parse_changelog(self.accessor.as_ref(), &self.settings)
    }

    /// Apply every pending changeset selected by `contexts` and `labels`
    pub fn update(&mut self, contexts: &Selection, labels: &Selection) -> Result<ExecutionReport> {
        let deployment_id = new_deployment_id();
        log::info!(
            "Starting update {} of {} (contexts: '{}', labels: '{}')",
            deployment_id,
            self.settings.changelog,
            contexts,
            labels
        );

        let accessor = self.accessor.as_ref();
        let settings = &self.settings;
        let registry = &self.registry;
        let cancel = &self.cancel;
        with_lock(&self.lock, self.db.as_mut(), |db| {
            let changesets = parse_changelog(accessor, settings)?;
            let mut ledger = Ledger::load(db, deployment_id)?;
            let planner = ExecutionPlanner::new(contexts.clone(), labels.clone());
            let plan = planner.plan(&changesets, ledger.snapshot())?;
            log::info!("{} changesets to run", plan.len());

            Ledger::ensure_table(db)?;
            Executor::new(&planner, registry)
                .with_cancel_token(cancel.clone())
                .run(&plan, db, &mut ledger)
        })
    }

    /// SQL that `update` would run, without running it
    pub fn update_sql(&mut self, contexts: &Selection, labels: &Selection) -> Result<String> {
        let accessor = self.accessor.as_ref();
        let settings = &self.settings;
        let registry = &self.registry;
        with_lock(&self.lock, self.db.as_mut(), |db| {
            let changesets = parse_changelog(accessor, settings)?;
            let snapshot = LedgerSnapshot::from_entries(db.read_ledger()?);
            let planner = ExecutionPlanner::new(contexts.clone(), labels.clone());
            let plan = planner.plan(&changesets, &snapshot)?;
            let schema = db.default_schema().map(str::to_string);
            Executor::new(&planner, registry).preview(&plan, schema.as_deref())
        })
    }

    /// Applied and pending changesets
    pub fn status(&mut self, contexts: &Selection, labels: &Selection) -> Result<StatusReport> {
        let accessor = self.accessor.as_ref();
        let settings = &self.settings;
        with_lock(&self.lock, self.db.as_mut(), |db| {
            let changesets = parse_changelog(accessor, settings)?;
            let snapshot = LedgerSnapshot::from_entries(db.read_ledger()?);
            let planner = ExecutionPlanner::new(contexts.clone(), labels.clone());
            let plan = planner.plan(&changesets, &snapshot)?;

            let declared: HashSet<&ChangeSetId> = changesets.iter().map(|c| &c.id).collect();
            let applied: Vec<_> = snapshot.applied().into_iter().cloned().collect();
            let unknown = applied
                .iter()
                .map(|e| e.changeset.clone())
                .filter(|id| !declared.contains(id))
                .collect();
            let pending = plan
                .items
                .iter()
                .map(|p| PendingChangeSet {
                    changeset: p.changeset.id.clone(),
                    reason: p.reason,
                    description: p.changeset.description(),
                })
                .collect();

            Ok(StatusReport {
                applied,
                pending,
                unknown,
            })
        })
    }

    /// Check the changelog against the ledger and the SQL dialect
    ///
    /// Read-only; does not take the lock.
    pub fn validate(&mut self) -> Result<ValidationReport> {
        let changesets = self.changesets()?;
        let snapshot = LedgerSnapshot::from_entries(self.db.read_ledger()?);
        let schema = self.db.default_schema().map(str::to_string);
        let ctx = SqlContext::new(schema.as_deref(), &self.registry);

        let mut report = ValidationReport {
            changesets: changesets.len(),
            checksum_errors: planner::checksum_errors(&changesets, &snapshot),
            ..ValidationReport::default()
        };
        for changeset in &changesets {
            match changeset.forward_sql(&ctx) {
                Ok(statements) => {
                    for statement in statements {
                        if let Err(msg) = check_sql_syntax(&statement) {
                            report
                                .syntax_warnings
                                .push(format!("{}: {}", changeset.id, msg));
                        }
                    }
                }
                Err(e) => report.syntax_warnings.push(format!("{}: {}", changeset.id, e)),
            }
            if changeset.rollback_sql(&ctx).is_err() {
                report.missing_rollback.push(changeset.id.clone());
            }
        }
        Ok(report)
    }

    /// Roll back every changeset applied after `target`, newest first
    pub fn rollback(&mut self, target: &ChangeSetRef) -> Result<ExecutionReport> {
        log::info!("Rolling back to {}", target);
        self.rollback_where(|applied| {
            let positions: Vec<usize> = applied
                .iter()
                .enumerate()
                .filter(|(_, id)| target.matches(id))
                .map(|(i, _)| i)
                .collect();
            match positions.as_slice() {
                [] => Err(Error::Rollback(format!("changeset {} is not applied", target))),
                [pos] => Ok(pos + 1),
                _ => Err(Error::validation(format!(
                    "rollback target {} is ambiguous; use path::id::author",
                    target
                ))),
            }
        })
    }

    /// Roll back the last `count` applied changesets, newest first
    pub fn rollback_count(&mut self, count: usize) -> Result<ExecutionReport> {
        log::info!("Rolling back the last {} changesets", count);
        self.rollback_where(|applied| Ok(applied.len().saturating_sub(count)))
    }

    /// Roll back applied changesets from the index chosen by `start` onwards
    fn rollback_where(
        &mut self,
        start: impl FnOnce(&[ChangeSetId]) -> Result<usize>,
    ) -> Result<ExecutionReport> {
        let deployment_id = new_deployment_id();
        let accessor = self.accessor.as_ref();
        let settings = &self.settings;
        let registry = &self.registry;
        let cancel = &self.cancel;
        with_lock(&self.lock, self.db.as_mut(), |db| {
            let changesets = parse_changelog(accessor, settings)?;
            let mut ledger = Ledger::load(db, deployment_id)?;
            let applied: Vec<ChangeSetId> = ledger
                .snapshot()
                .applied()
                .into_iter()
                .map(|e| e.changeset.clone())
                .collect();
            let from = start(&applied)?;

            let mut targets = Vec::new();
            for id in applied[from..].iter().rev() {
                let changeset = changesets.iter().find(|c| &c.id == id).ok_or_else(|| {
                    Error::Rollback(format!(
                        "changeset {} is not in the changelog; cannot roll it back",
                        id
                    ))
                })?;
                targets.push(changeset);
            }
            if targets.is_empty() {
                log::info!("Nothing to roll back");
            }

            let planner = ExecutionPlanner::default();
            Executor::new(&planner, registry)
                .with_cancel_token(cancel.clone())
                .rollback(&targets, db, &mut ledger)
        })
    }

    /// Drop every view, table and sequence in the target schema
    ///
    /// The ledger goes too; the lock table survives because the lock is
    /// held while dropping.
    pub fn drop_all(&mut self) -> Result<DropReport> {
        log::warn!("Dropping all objects in the target schema");
        with_lock(&self.lock, self.db.as_mut(), |db| {
            let mut remaining: Vec<SchemaObject> = db
                .list_objects()?
                .into_iter()
                .filter(|o| !o.name.eq_ignore_ascii_case(LOCK_TABLE))
                .collect();

            // Dependencies between objects are not introspected; retry until
            // a pass makes no progress
            let mut report = DropReport::default();
            while !remaining.is_empty() {
                let attempted = remaining.len();
                let mut failed = Vec::new();
                let mut last_error = None;
                for object in remaining {
                    let name = format!(
                        "{}.{}",
                        quote_ident(&object.schema),
                        quote_ident(&object.name)
                    );
                    let keyword = object.kind.keyword();
                    match db.execute(&format!("DROP {} IF EXISTS {}", keyword, name)) {
                        Ok(()) => {
                            log::info!("Dropped {} {}", keyword, name);
                            report.dropped.push(format!("{} {}", keyword, name));
                        }
                        Err(e) => {
                            last_error = Some(e);
                            failed.push(object);
                        }
                    }
                }
                if failed.len() == attempted {
                    if let Some(e) = last_error {
                        return Err(e);
                    }
                }
                remaining = failed;
            }
            Ok(report)
        })
    }

    /// Current lock holder; does not take the lock
    pub fn list_locks(&mut self) -> Result<LockStatus> {
        let record = LockManager::current(self.db.as_mut())?;
        Ok(LockStatus {
            locked: record.is_some(),
            record,
        })
    }

    /// Remove the lock row regardless of who holds it
    pub fn force_release_locks(&mut self) -> Result<bool> {
        LockManager::force_release(self.db.as_mut())
    }
}

fn parse_changelog(accessor: &dyn ResourceAccessor, settings: &MigrationSettings) -> Result<Vec<ChangeSet>> {
    ChangeLogParser::new(accessor)
        .with_parameters(&settings.parameters)
        .parse(&settings.changelog)
}

/// Run `work` while holding the migration lock
///
/// A release failure is reported only when `work` succeeded; otherwise the
/// original error wins and the release failure is logged.
fn with_lock<T>(
    lock: &LockManager,
    db: &mut dyn Database,
    work: impl FnOnce(&mut dyn Database) -> Result<T>,
) -> Result<T> {
    let mut guard = lock.acquire(db)?;
    let result = work(&mut *guard);
    match (result, guard.release()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            log::error!("Failed to release migration lock: {}", release_err);
            Err(e)
        }
    }
}

fn new_deployment_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}
