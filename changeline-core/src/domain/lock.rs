//! Migration lock row

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the lock table in the target schema
pub const LOCK_TABLE: &str = "changeline_lock";

/// The singleton lock row: who holds the lock and since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}
