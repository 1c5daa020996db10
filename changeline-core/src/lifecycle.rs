//! Startup migrations for an embedding application
//!
//! `MigrationLifecycle::on_startup` is called once while the host starts.
//! It honours the global switch and the config's `shouldRun`, prepares the
//! connection and applies the changelog.

use std::sync::Arc;

use crate::config::{parse_bool, MigrationConfig, SHOULD_RUN_ENV};
use crate::domain::result::Result;
use crate::domain::{ChangeRegistry, ExecutionReport};
use crate::facade::MigrationFacade;
use crate::ports::{DataSource, Database, ResourceAccessor};
use crate::services::lock::hostname;

/// Prepares a fresh connection before migrating
pub type DatabaseCustomizer =
    Box<dyn Fn(&mut dyn Database, &MigrationConfig) -> Result<()> + Send + Sync>;

/// Sets the connection's default schema from the config, if one is given
pub fn default_customizer() -> DatabaseCustomizer {
    Box::new(|db: &mut dyn Database, config: &MigrationConfig| {
        if let Some(schema) = &config.default_schema {
            db.set_default_schema(schema)?;
        }
        Ok(())
    })
}

pub struct MigrationLifecycle {
    config: MigrationConfig,
    data_source: Arc<dyn DataSource>,
    accessor: Arc<dyn ResourceAccessor>,
    registry: ChangeRegistry,
    customizer: DatabaseCustomizer,
    global_should_run: Option<bool>,
    initialized: bool,
    update_successful: bool,
}

impl MigrationLifecycle {
    pub fn new(
        config: MigrationConfig,
        data_source: Arc<dyn DataSource>,
        accessor: Arc<dyn ResourceAccessor>,
    ) -> Self {
        Self {
            config,
            data_source,
            accessor,
            registry: ChangeRegistry::new(),
            customizer: default_customizer(),
            global_should_run: None,
            initialized: false,
            update_successful: false,
        }
    }

    pub fn with_customizer(mut self, customizer: DatabaseCustomizer) -> Self {
        self.customizer = customizer;
        self
    }

    pub fn with_registry(mut self, registry: ChangeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Fix the global switch instead of reading `CHANGELINE_SHOULD_RUN`
    pub fn with_global_should_run(mut self, should_run: bool) -> Self {
        self.global_should_run = Some(should_run);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Whether `on_startup` got past the switches
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the last startup update finished without failures
    pub fn is_update_successful(&self) -> bool {
        self.update_successful
    }

    /// Run startup migrations
    ///
    /// Returns `None` when migrations are switched off. Errors are logged
    /// and returned; the host should treat them as fatal.
    pub fn on_startup(&mut self) -> Result<Option<ExecutionReport>> {
        let global = match self.global_should_run {
            Some(value) => value,
            None => match std::env::var(SHOULD_RUN_ENV) {
                Ok(value) => parse_bool(SHOULD_RUN_ENV, &value)?,
                Err(_) => true,
            },
        };
        if !global {
            log::info!(
                "Changeline disabled on {} because {} is false",
                hostname(),
                SHOULD_RUN_ENV
            );
            return Ok(None);
        }
        if !self.config.should_run {
            log::info!(
                "Changeline disabled on {} because shouldRun is false",
                hostname()
            );
            return Ok(None);
        }

        self.initialized = true;
        self.update_successful = false;
        match self.migrate() {
            Ok(report) => {
                self.update_successful = report.is_success();
                if let Some(error) = &report.first_error {
                    log::warn!("Startup update finished with failures: {}", error);
                }
                Ok(Some(report))
            }
            Err(e) => {
                log::error!("Startup migration on {} failed: {}", self.data_source.describe(), e);
                Err(e)
            }
        }
    }

    fn migrate(&self) -> Result<ExecutionReport> {
        log::info!("Running startup migrations against {}", self.data_source.describe());
        let mut db = self.data_source.connect()?;
        (self.customizer)(db.as_mut(), &self.config)?;

        let mut facade =
            MigrationFacade::new(db, Arc::clone(&self.accessor), self.config.settings())
                .with_registry(self.registry.clone());
        if self.config.drop_first {
            let dropped = facade.drop_all()?;
            log::info!("Dropped {} objects before update", dropped.dropped.len());
        }
        facade.update(&self.config.contexts(), &self.config.labels())
    }
}
