//! Data source port - opens connections to the target database

use crate::domain::result::Result;

use super::database::Database;

/// Factory for target database connections
pub trait DataSource: Send + Sync {
    /// Human-readable location for log messages
    fn describe(&self) -> String;

    fn connect(&self) -> Result<Box<dyn Database>>;
}
