//! Changelog parser - turns JSON changelog documents into changesets
//!
//! A changelog is a JSON object with a `databaseChangeLog` array. Entries are
//! processed in order: `property` defines a parameter, `include` and
//! `includeAll` splice in other changelogs at that point (depth first), and
//! `changeSet` declares a changeset. `${name}` placeholders in string values
//! are expanded before a changeset is read; `${name:default}` supplies a
//! fallback. The parser never touches the database.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::checksum;
use crate::domain::result::{Error, Result};
use crate::domain::{Change, ChangeSet, ChangeSetId, Expression, OnFail, Precondition, Preconditions};
use crate::ports::ResourceAccessor;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}").expect("static regex"))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInclude {
    file: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIncludeAll {
    path: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

#[derive(Debug, Deserialize)]
struct RawProperty {
    name: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeSet {
    id: String,
    author: String,
    #[serde(default, alias = "contextFilter", alias = "contexts")]
    context: Option<String>,
    #[serde(default)]
    labels: Option<String>,
    #[serde(default)]
    run_always: bool,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default = "default_true")]
    fail_on_error: bool,
    #[serde(default = "default_true")]
    run_in_transaction: bool,
    #[serde(default, rename = "validCheckSum")]
    valid_checksums: Vec<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default, rename = "preConditions")]
    preconditions: Option<Value>,
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(default)]
    rollback: Vec<Change>,
}

/// Mutable state threaded through one parse
#[derive(Default)]
struct ParseState {
    /// Effective parameters; the first definition of a name wins
    params: BTreeMap<String, String>,
    /// Physical paths of the changelogs currently being parsed
    stack: Vec<String>,
    seen: HashSet<ChangeSetId>,
    changesets: Vec<ChangeSet>,
}

/// Parses a root changelog and everything it includes
pub struct ChangeLogParser<'a> {
    accessor: &'a dyn ResourceAccessor,
    parameters: BTreeMap<String, String>,
}

impl<'a> ChangeLogParser<'a> {
    pub fn new(accessor: &'a dyn ResourceAccessor) -> Self {
        Self {
            accessor,
            parameters: BTreeMap::new(),
        }
    }

    /// Caller-supplied parameters; they take precedence over `property` entries
    pub fn with_parameters(mut self, parameters: &BTreeMap<String, String>) -> Self {
        self.parameters = parameters.clone();
        self
    }

    /// Parse the changelog at `path`, returning changesets in declaration order
    pub fn parse(&self, path: &str) -> Result<Vec<ChangeSet>> {
        let mut state = ParseState {
            params: self.parameters.clone(),
            ..ParseState::default()
        };
        self.parse_file(&normalize_path(path), &mut state)?;
        log::debug!("Parsed {} changesets from {}", state.changesets.len(), path);
        Ok(state.changesets)
    }

    fn parse_file(&self, path: &str, state: &mut ParseState) -> Result<()> {
        if state.stack.iter().any(|p| p == path) {
            let mut chain = state.stack.clone();
            chain.push(path.to_string());
            return Err(Error::parse(
                path,
                format!("circular include: {}", chain.join(" -> ")),
            ));
        }

        let bytes = self.accessor.read(path).map_err(|e| match e {
            Error::Parse { .. } => e,
            other => Error::parse(path, other.to_string()),
        })?;
        let doc: Value =
            serde_json::from_slice(&bytes).map_err(|e| Error::parse(path, e.to_string()))?;

        let logical_path = match doc.get("logicalFilePath") {
            Some(Value::String(p)) => normalize_path(&expand_str(p, &state.params, path)?),
            Some(_) => return Err(Error::parse(path, "logicalFilePath must be a string")),
            None => path.to_string(),
        };
        let entries = doc
            .get("databaseChangeLog")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::parse(path, "missing 'databaseChangeLog' array"))?;

        state.stack.push(path.to_string());
        for (index, entry) in entries.iter().enumerate() {
            self.parse_entry(path, &logical_path, index, entry, state)?;
        }
        state.stack.pop();
        Ok(())
    }

    fn parse_entry(
        &self,
        path: &str,
        logical_path: &str,
        index: usize,
        entry: &Value,
        state: &mut ParseState,
    ) -> Result<()> {
        let (kind, body) = match entry.as_object() {
            Some(obj) if obj.len() == 1 => obj.iter().next().map(|(k, v)| (k.as_str(), v)),
            _ => None,
        }
        .ok_or_else(|| {
            Error::parse(
                path,
                format!("entry {} must be an object with exactly one key", index),
            )
        })?;

        match kind {
            "property" => {
                let prop: RawProperty = from_value(body.clone(), path)?;
                let value = match prop.value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                state.params.entry(prop.name).or_insert(value);
            }
            "include" => {
                let include: RawInclude = from_value(expand_value(body, &state.params, path)?, path)?;
                let target = resolve_path(path, &include.file, include.relative_to_changelog_file);
                self.parse_file(&target, state)?;
            }
            "includeAll" => {
                let include: RawIncludeAll =
                    from_value(expand_value(body, &state.params, path)?, path)?;
                let dir = resolve_path(path, &include.path, include.relative_to_changelog_file);
                let mut files: Vec<String> = self
                    .accessor
                    .list(&dir)
                    .map_err(|e| Error::parse(path, format!("includeAll {}: {}", dir, e)))?
                    .into_iter()
                    .filter(|f| f.ends_with(".json"))
                    .map(|f| normalize_path(&f))
                    .collect();
                files.sort();
                for file in files {
                    self.parse_file(&file, state)?;
                }
            }
            "changeSet" => {
                let expanded = expand_value(body, &state.params, path)?;
                let changeset = self.build_changeset(path, logical_path, expanded, state)?;
                if !state.seen.insert(changeset.id.clone()) {
                    return Err(Error::parse(
                        path,
                        format!("duplicate changeset identity {}", changeset.id),
                    ));
                }
                state.changesets.push(changeset);
            }
            other => {
                return Err(Error::parse(
                    path,
                    format!("unknown changelog entry '{}' at position {}", other, index),
                ))
            }
        }
        Ok(())
    }

    fn build_changeset(
        &self,
        path: &str,
        logical_path: &str,
        body: Value,
        state: &ParseState,
    ) -> Result<ChangeSet> {
        let raw: RawChangeSet = from_value(body, path)?;
        if raw.id.trim().is_empty() || raw.author.trim().is_empty() {
            return Err(Error::parse(path, "changeSet requires a non-empty id and author"));
        }
        let id = ChangeSetId::new(raw.id, raw.author, logical_path);

        let expression = |text: Option<&str>| {
            Expression::parse(text.unwrap_or(""))
                .map_err(|e| Error::parse(path, format!("changeset {}: {}", id, e)))
        };
        let context = expression(raw.context.as_deref())?;
        let labels = expression(raw.labels.as_deref())?;

        let changes = self.resolve_sql_files(path, raw.changes, state)?;
        let rollback = self.resolve_sql_files(path, raw.rollback, state)?;
        let preconditions = raw
            .preconditions
            .map(|value| parse_preconditions(value, path))
            .transpose()?;

        Ok(ChangeSet {
            checksum: checksum::compute(&changes),
            id,
            changes,
            rollback,
            context,
            labels,
            run_always: raw.run_always,
            run_on_change: raw.run_on_change,
            fail_on_error: raw.fail_on_error,
            run_in_transaction: raw.run_in_transaction,
            preconditions,
            valid_checksums: raw.valid_checksums,
            comment: raw.comment,
        })
    }

    /// Replace `sqlFile` changes with the SQL they reference
    fn resolve_sql_files(
        &self,
        path: &str,
        changes: Vec<Change>,
        state: &ParseState,
    ) -> Result<Vec<Change>> {
        changes
            .into_iter()
            .map(|change| match change {
                Change::SqlFile {
                    path: file,
                    relative_to_changelog_file,
                } => {
                    let target = resolve_path(path, &file, relative_to_changelog_file);
                    let bytes = self.accessor.read(&target).map_err(|e| {
                        Error::parse(path, format!("sqlFile {}: {}", target, e))
                    })?;
                    let sql = String::from_utf8(bytes)
                        .map_err(|_| Error::parse(path, format!("sqlFile {} is not UTF-8", target)))?;
                    Ok(Change::Sql {
                        sql: expand_str(&sql, &state.params, path)?,
                        comment: Some(file),
                    })
                }
                other => Ok(other),
            })
            .collect()
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value, path: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::parse(path, e.to_string()))
}

/// Read a `preConditions` block
///
/// Conditions may be listed under `conditions` or given directly as keys
/// next to `onFail`, e.g. `{"onFail": "MARK_RAN", "tableExists": {...}}`.
fn parse_preconditions(value: Value, path: &str) -> Result<Preconditions> {
    let Value::Object(map) = value else {
        return Err(Error::parse(path, "preConditions must be an object"));
    };

    let mut preconditions = Preconditions {
        on_fail: OnFail::default(),
        on_fail_message: None,
        conditions: Vec::new(),
    };
    for (key, val) in map {
        match key.as_str() {
            "onFail" => preconditions.on_fail = from_value(val, path)?,
            "onFailMessage" => preconditions.on_fail_message = from_value(val, path)?,
            "conditions" => {
                let list: Vec<Precondition> = from_value(val, path)?;
                preconditions.conditions.extend(list);
            }
            _ => {
                let mut single = Map::new();
                single.insert(key, val);
                let condition: Precondition = from_value(Value::Object(single), path)?;
                preconditions.conditions.push(condition);
            }
        }
    }
    Ok(preconditions)
}

/// Expand placeholders in every string of a JSON value (keys are left alone)
fn expand_value(value: &Value, params: &BTreeMap<String, String>, path: &str) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(expand_str(s, params, path)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| expand_value(v, params, path))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.clone(), expand_value(v, params, path)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn expand_str(input: &str, params: &BTreeMap<String, String>, path: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&input[last..whole.start()]);
        out.push_str(&lookup(&caps, params, path)?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn lookup(caps: &Captures<'_>, params: &BTreeMap<String, String>, path: &str) -> Result<String> {
    let name = caps[1].trim();
    match (params.get(name), caps.get(2)) {
        (Some(value), _) => Ok(value.clone()),
        (None, Some(default)) => Ok(default.as_str().to_string()),
        (None, None) => Err(Error::parse(
            path,
            format!("undefined parameter '{}' with no default", name),
        )),
    }
}

/// Resolve an include target against the including changelog
fn resolve_path(including: &str, target: &str, relative: bool) -> String {
    let target = target.replace('\\', "/");
    if !relative {
        return normalize_path(&target);
    }
    match including.rsplit_once('/') {
        Some((dir, _)) => normalize_path(&format!("{}/{}", dir, target)),
        None => normalize_path(&target),
    }
}

/// Collapse `.`, `..` and repeated separators in a `/` path
fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}
