//! ChangeSet domain model

use std::fmt;

use serde::{Deserialize, Serialize};

use super::change::{Change, SqlContext};
use super::expression::Expression;
use super::result::{Error, Result};

/// Identity of a changeset: (id, author, changelog path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetId {
    pub id: String,
    pub author: String,
    pub path: String,
}

impl ChangeSetId {
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

/// Reference to a changeset given by an operator (e.g. a rollback target)
///
/// Only `id` is required; `author` and `path` narrow the match when the
/// same id is used in several changelogs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSetRef {
    pub id: String,
    pub author: Option<String>,
    pub path: Option<String>,
}

impl ChangeSetRef {
    /// Parse `id`, `id::author` or `path::id::author`
    pub fn parse(s: &str) -> Self {
        let parts: Vec<&str> = s.split("::").collect();
        match parts.as_slice() {
            [path, id, author] => Self {
                id: id.to_string(),
                author: Some(author.to_string()),
                path: Some(path.to_string()),
            },
            [id, author] => Self {
                id: id.to_string(),
                author: Some(author.to_string()),
                path: None,
            },
            _ => Self {
                id: s.to_string(),
                author: None,
                path: None,
            },
        }
    }

    pub fn matches(&self, id: &ChangeSetId) -> bool {
        self.id == id.id
            && self.author.as_deref().map_or(true, |a| a == id.author)
            && self.path.as_deref().map_or(true, |p| p == id.path)
    }
}

impl fmt::Display for ChangeSetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.author) {
            (Some(path), Some(author)) => write!(f, "{}::{}::{}", path, self.id, author),
            (None, Some(author)) => write!(f, "{}::{}", self.id, author),
            _ => write!(f, "{}", self.id),
        }
    }
}

/// What to do when a changeset's preconditions do not hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFail {
    /// Abort the run with a precondition error
    #[default]
    Halt,
    /// Skip the changeset for this run, it is retried next time
    Continue,
    /// Record the changeset as ran without executing it
    MarkRan,
    /// Log a warning and run the changeset anyway
    Warn,
}

/// Assertion about database state, checked before a changeset runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    #[serde(rename_all = "camelCase")]
    TableExists {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ColumnExists {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        column_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ViewExists {
        #[serde(default)]
        schema_name: Option<String>,
        view_name: String,
    },
    /// Single-value query whose result must equal `expected_result`
    #[serde(rename_all = "camelCase")]
    SqlCheck { expected_result: String, sql: String },
    #[serde(rename_all = "camelCase")]
    ChangeSetExecuted {
        id: String,
        author: String,
        change_log_file: String,
    },
    Not(Vec<Precondition>),
    And(Vec<Precondition>),
    Or(Vec<Precondition>),
}

impl Precondition {
    /// Human-readable description used in failure messages
    pub fn describe(&self) -> String {
        match self {
            Self::TableExists { table_name, .. } => format!("table {} exists", table_name),
            Self::ColumnExists {
                table_name,
                column_name,
                ..
            } => format!("column {}.{} exists", table_name, column_name),
            Self::ViewExists { view_name, .. } => format!("view {} exists", view_name),
            Self::SqlCheck {
                expected_result,
                sql,
            } => format!("'{}' returns {}", sql.trim(), expected_result),
            Self::ChangeSetExecuted {
                id,
                author,
                change_log_file,
            } => format!("changeset {}::{}::{} executed", change_log_file, id, author),
            Self::Not(inner) => format!("not ({})", join_descriptions(inner, " and ")),
            Self::And(inner) => format!("({})", join_descriptions(inner, " and ")),
            Self::Or(inner) => format!("({})", join_descriptions(inner, " or ")),
        }
    }
}

fn join_descriptions(conditions: &[Precondition], sep: &str) -> String {
    conditions
        .iter()
        .map(Precondition::describe)
        .collect::<Vec<_>>()
        .join(sep)
}

/// Preconditions block of a changeset: all conditions must hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preconditions {
    #[serde(default)]
    pub on_fail: OnFail,
    #[serde(default)]
    pub on_fail_message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Precondition>,
}

/// One uniquely identified, atomic unit of schema or data change
///
/// Immutable once parsed: planning and execution only borrow it.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub changes: Vec<Change>,
    /// Explicit rollback; empty means derive it from `changes`
    pub rollback: Vec<Change>,
    pub context: Expression,
    pub labels: Expression,
    pub run_always: bool,
    pub run_on_change: bool,
    pub fail_on_error: bool,
    pub run_in_transaction: bool,
    pub preconditions: Option<Preconditions>,
    /// Additional checksums accepted as unchanged (`ANY` accepts every value)
    pub valid_checksums: Vec<String>,
    pub comment: Option<String>,
    pub checksum: String,
}

impl ChangeSet {
    /// Whether `recorded` is an acceptable checksum for the declared content
    ///
    /// Rows written without a checksum match anything.
    pub fn checksum_matches(&self, recorded: Option<&str>) -> bool {
        match recorded {
            None => true,
            Some(recorded) => {
                recorded == self.checksum
                    || self
                        .valid_checksums
                        .iter()
                        .any(|c| c == recorded || c.eq_ignore_ascii_case("ANY"))
            }
        }
    }

    /// Forward SQL for every change, in declaration order
    pub fn forward_sql(&self, ctx: &SqlContext<'_>) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        for change in &self.changes {
            statements.extend(change.forward_sql(ctx)?);
        }
        Ok(statements)
    }

    /// SQL that undoes this changeset
    ///
    /// Uses the explicit rollback block when present, otherwise the inverse
    /// of each change in reverse order. Fails if any change has no inverse.
    pub fn rollback_sql(&self, ctx: &SqlContext<'_>) -> Result<Vec<String>> {
        if !self.rollback.is_empty() {
            let mut statements = Vec::new();
            for change in &self.rollback {
                statements.extend(change.forward_sql(ctx)?);
            }
            return Ok(statements);
        }

        let mut statements = Vec::new();
        for change in self.changes.iter().rev() {
            match change.rollback_sql(ctx)? {
                Some(sql) => statements.extend(sql),
                None => {
                    return Err(Error::Rollback(format!(
                        "changeset {} has no rollback for '{}' and declares none",
                        self.id,
                        change.kind()
                    )))
                }
            }
        }
        Ok(statements)
    }

    /// Short summary of the changes, stored in the ledger
    pub fn description(&self) -> String {
        if self.changes.is_empty() {
            return "empty".to_string();
        }
        self.changes
            .iter()
            .map(Change::summary)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
