//! Changeset checksums
//!
//! The checksum covers what a changeset does (its changes) and nothing
//! else: contexts, labels, comments and rollback blocks can be edited
//! without invalidating an applied changeset. SQL text is compared with
//! whitespace collapsed so reformatting is not reported as drift.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::change::Change;

/// Version prefix, bumped whenever the hashed representation changes
const CHECKSUM_VERSION: u32 = 1;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Collapse runs of whitespace and trim
pub fn normalize_sql(sql: &str) -> String {
    whitespace_re().replace_all(sql.trim(), " ").to_string()
}

/// Canonical text of one change
fn canonical(change: &Change) -> String {
    match change {
        Change::Sql { sql, .. } => format!("sql:{}", normalize_sql(sql)),
        Change::CreateView {
            schema_name,
            view_name,
            select_query,
            replace_if_exists,
        } => format!(
            "createView:{}:{}:{}:{}",
            schema_name.as_deref().unwrap_or(""),
            view_name,
            replace_if_exists,
            normalize_sql(select_query)
        ),
        // Struct field order is fixed, so serde output is stable
        other => serde_json::to_string(other).unwrap_or_else(|_| other.summary()),
    }
}

/// Compute the checksum of a list of changes
pub fn compute(changes: &[Change]) -> String {
    let mut hasher = Sha256::new();
    for change in changes {
        hasher.update(canonical(change).as_bytes());
        hasher.update(b"\n");
    }
    format!("{}:{}", CHECKSUM_VERSION, hex::encode(hasher.finalize()))
}
