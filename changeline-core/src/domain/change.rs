//! Change operations and their SQL generation
//!
//! `Change` is a closed set of operations. New operation kinds are added
//! through `Change::Custom`, which names a generator registered in a
//! `ChangeRegistry`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::result::{Error, Result};

/// Generator for a custom change kind
pub trait CustomChange: Send + Sync {
    /// Statements that apply the change
    fn forward_sql(&self, params: &Map<String, Value>, ctx: &SqlContext<'_>) -> Result<Vec<String>>;

    /// Statements that undo the change, `None` if it cannot be undone
    fn rollback_sql(
        &self,
        _params: &Map<String, Value>,
        _ctx: &SqlContext<'_>,
    ) -> Result<Option<Vec<String>>> {
        Ok(None)
    }
}

/// Registry of custom change generators, keyed by name
#[derive(Clone, Default)]
pub struct ChangeRegistry {
    generators: HashMap<String, Arc<dyn CustomChange>>,
}

impl ChangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator; replaces any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, generator: impl CustomChange + 'static) {
        self.generators.insert(name.into(), Arc::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomChange>> {
        self.generators.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }
}

impl fmt::Debug for ChangeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.generators.keys().collect();
        names.sort();
        f.debug_struct("ChangeRegistry").field("generators", &names).finish()
    }
}

/// Inputs shared by all SQL generation
#[derive(Debug, Clone, Copy)]
pub struct SqlContext<'a> {
    pub default_schema: Option<&'a str>,
    pub registry: &'a ChangeRegistry,
}

impl<'a> SqlContext<'a> {
    pub fn new(default_schema: Option<&'a str>, registry: &'a ChangeRegistry) -> Self {
        Self {
            default_schema,
            registry,
        }
    }

    /// Qualified, quoted object name
    pub fn qualify(&self, schema: Option<&str>, name: &str) -> String {
        match schema.or(self.default_schema) {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
            None => quote_ident(name),
        }
    }
}

/// Quote an identifier with double quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a JSON value as a SQL literal
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnConstraints {
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub constraints: Option<ColumnConstraints>,
}

impl ColumnConfig {
    fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.data_type);
        if let Some(default) = &self.default_value {
            def.push_str(&format!(" DEFAULT {}", sql_literal(default)));
        }
        if let Some(c) = &self.constraints {
            if c.primary_key {
                def.push_str(" PRIMARY KEY");
            } else {
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                if c.unique {
                    def.push_str(" UNIQUE");
                }
            }
        }
        def
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnValue {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
}

/// One atomic operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Change {
    #[serde(rename_all = "camelCase")]
    Sql {
        sql: String,
        #[serde(default)]
        comment: Option<String>,
    },
    /// External SQL file; the parser replaces it with `Sql`
    #[serde(rename_all = "camelCase")]
    SqlFile {
        path: String,
        #[serde(default)]
        relative_to_changelog_file: bool,
    },
    #[serde(rename_all = "camelCase")]
    CreateTable {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        columns: Vec<ColumnConfig>,
    },
    #[serde(rename_all = "camelCase")]
    DropTable {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        #[serde(default)]
        cascade_constraints: bool,
    },
    #[serde(rename_all = "camelCase")]
    AddColumn {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        columns: Vec<ColumnConfig>,
    },
    #[serde(rename_all = "camelCase")]
    DropColumn {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        column_name: String,
    },
    #[serde(rename_all = "camelCase")]
    RenameTable {
        #[serde(default)]
        schema_name: Option<String>,
        old_table_name: String,
        new_table_name: String,
    },
    #[serde(rename_all = "camelCase")]
    RenameColumn {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        old_column_name: String,
        new_column_name: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateIndex {
        #[serde(default)]
        schema_name: Option<String>,
        index_name: String,
        table_name: String,
        columns: Vec<IndexColumn>,
        #[serde(default)]
        unique: bool,
    },
    #[serde(rename_all = "camelCase")]
    DropIndex {
        #[serde(default)]
        schema_name: Option<String>,
        index_name: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateView {
        #[serde(default)]
        schema_name: Option<String>,
        view_name: String,
        select_query: String,
        #[serde(default)]
        replace_if_exists: bool,
    },
    #[serde(rename_all = "camelCase")]
    DropView {
        #[serde(default)]
        schema_name: Option<String>,
        view_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Insert {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        columns: Vec<ColumnValue>,
    },
    #[serde(rename_all = "camelCase")]
    Custom {
        name: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

impl Change {
    /// Operation kind as written in a changelog
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sql { .. } => "sql",
            Self::SqlFile { .. } => "sqlFile",
            Self::CreateTable { .. } => "createTable",
            Self::DropTable { .. } => "dropTable",
            Self::AddColumn { .. } => "addColumn",
            Self::DropColumn { .. } => "dropColumn",
            Self::RenameTable { .. } => "renameTable",
            Self::RenameColumn { .. } => "renameColumn",
            Self::CreateIndex { .. } => "createIndex",
            Self::DropIndex { .. } => "dropIndex",
            Self::CreateView { .. } => "createView",
            Self::DropView { .. } => "dropView",
            Self::Insert { .. } => "insert",
            Self::Custom { .. } => "custom",
        }
    }

    /// One-line summary for ledger descriptions
    pub fn summary(&self) -> String {
        match self {
            Self::Sql { comment, .. } => match comment {
                Some(c) => format!("sql ({})", c),
                None => "sql".to_string(),
            },
            Self::SqlFile { path, .. } => format!("sqlFile {}", path),
            Self::CreateTable { table_name, .. } => format!("createTable {}", table_name),
            Self::DropTable { table_name, .. } => format!("dropTable {}", table_name),
            Self::AddColumn { table_name, .. } => format!("addColumn {}", table_name),
            Self::DropColumn {
                table_name,
                column_name,
                ..
            } => format!("dropColumn {}.{}", table_name, column_name),
            Self::RenameTable { new_table_name, .. } => format!("renameTable {}", new_table_name),
            Self::RenameColumn {
                table_name,
                new_column_name,
                ..
            } => format!("renameColumn {}.{}", table_name, new_column_name),
            Self::CreateIndex { index_name, .. } => format!("createIndex {}", index_name),
            Self::DropIndex { index_name, .. } => format!("dropIndex {}", index_name),
            Self::CreateView { view_name, .. } => format!("createView {}", view_name),
            Self::DropView { view_name, .. } => format!("dropView {}", view_name),
            Self::Insert { table_name, .. } => format!("insert {}", table_name),
            Self::Custom { name, .. } => format!("custom {}", name),
        }
    }

    /// Statements that apply this change
    pub fn forward_sql(&self, ctx: &SqlContext<'_>) -> Result<Vec<String>> {
        let statements = match self {
            Self::Sql { sql, .. } => vec![sql.trim().to_string()],
            Self::SqlFile { path, .. } => {
                return Err(Error::validation(format!(
                    "sqlFile {} was not resolved by the changelog parser",
                    path
                )))
            }
            Self::CreateTable {
                schema_name,
                table_name,
                columns,
            } => {
                let cols: Vec<String> = columns.iter().map(ColumnConfig::definition).collect();
                vec![format!(
                    "CREATE TABLE {} ({})",
                    ctx.qualify(schema_name.as_deref(), table_name),
                    cols.join(", ")
                )]
            }
            Self::DropTable {
                schema_name,
                table_name,
                cascade_constraints,
            } => vec![format!(
                "DROP TABLE {}{}",
                ctx.qualify(schema_name.as_deref(), table_name),
                if *cascade_constraints { " CASCADE" } else { "" }
            )],
            Self::AddColumn {
                schema_name,
                table_name,
                columns,
            } => columns
                .iter()
                .map(|c| {
                    format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        ctx.qualify(schema_name.as_deref(), table_name),
                        c.definition()
                    )
                })
                .collect(),
            Self::DropColumn {
                schema_name,
                table_name,
                column_name,
            } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                ctx.qualify(schema_name.as_deref(), table_name),
                quote_ident(column_name)
            )],
            Self::RenameTable {
                schema_name,
                old_table_name,
                new_table_name,
            } => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                ctx.qualify(schema_name.as_deref(), old_table_name),
                quote_ident(new_table_name)
            )],
            Self::RenameColumn {
                schema_name,
                table_name,
                old_column_name,
                new_column_name,
            } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                ctx.qualify(schema_name.as_deref(), table_name),
                quote_ident(old_column_name),
                quote_ident(new_column_name)
            )],
            Self::CreateIndex {
                schema_name,
                index_name,
                table_name,
                columns,
                unique,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
                vec![format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_ident(index_name),
                    ctx.qualify(schema_name.as_deref(), table_name),
                    cols.join(", ")
                )]
            }
            Self::DropIndex {
                schema_name,
                index_name,
            } => vec![format!(
                "DROP INDEX {}",
                ctx.qualify(schema_name.as_deref(), index_name)
            )],
            Self::CreateView {
                schema_name,
                view_name,
                select_query,
                replace_if_exists,
            } => vec![format!(
                "CREATE {}VIEW {} AS {}",
                if *replace_if_exists { "OR REPLACE " } else { "" },
                ctx.qualify(schema_name.as_deref(), view_name),
                select_query.trim().trim_end_matches(';')
            )],
            Self::DropView {
                schema_name,
                view_name,
            } => vec![format!(
                "DROP VIEW {}",
                ctx.qualify(schema_name.as_deref(), view_name)
            )],
            Self::Insert {
                schema_name,
                table_name,
                columns,
            } => {
                let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
                let values: Vec<String> = columns.iter().map(|c| sql_literal(&c.value)).collect();
                vec![format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    ctx.qualify(schema_name.as_deref(), table_name),
                    names.join(", "),
                    values.join(", ")
                )]
            }
            Self::Custom { name, params } => {
                let generator = ctx.registry.get(name).ok_or_else(|| {
                    Error::validation(format!("no generator registered for custom change '{}'", name))
                })?;
                generator.forward_sql(params, ctx)?
            }
        };
        Ok(statements)
    }

    /// Statements that undo this change, `None` when there is no inverse
    pub fn rollback_sql(&self, ctx: &SqlContext<'_>) -> Result<Option<Vec<String>>> {
        let inverse = match self {
            Self::CreateTable {
                schema_name,
                table_name,
                ..
            } => Self::DropTable {
                schema_name: schema_name.clone(),
                table_name: table_name.clone(),
                cascade_constraints: false,
            },
            Self::AddColumn {
                schema_name,
                table_name,
                columns,
            } => {
                // One DROP per added column, newest first
                let statements = columns
                    .iter()
                    .rev()
                    .map(|c| {
                        format!(
                            "ALTER TABLE {} DROP COLUMN {}",
                            ctx.qualify(schema_name.as_deref(), table_name),
                            quote_ident(&c.name)
                        )
                    })
                    .collect();
                return Ok(Some(statements));
            }
            Self::RenameTable {
                schema_name,
                old_table_name,
                new_table_name,
            } => Self::RenameTable {
                schema_name: schema_name.clone(),
                old_table_name: new_table_name.clone(),
                new_table_name: old_table_name.clone(),
            },
            Self::RenameColumn {
                schema_name,
                table_name,
                old_column_name,
                new_column_name,
            } => Self::RenameColumn {
                schema_name: schema_name.clone(),
                table_name: table_name.clone(),
                old_column_name: new_column_name.clone(),
                new_column_name: old_column_name.clone(),
            },
            Self::CreateIndex {
                schema_name,
                index_name,
                ..
            } => Self::DropIndex {
                schema_name: schema_name.clone(),
                index_name: index_name.clone(),
            },
            Self::CreateView {
                schema_name,
                view_name,
                ..
            } => Self::DropView {
                schema_name: schema_name.clone(),
                view_name: view_name.clone(),
            },
            Self::Custom { name, params } => {
                let generator = ctx.registry.get(name).ok_or_else(|| {
                    Error::validation(format!("no generator registered for custom change '{}'", name))
                })?;
                return generator.rollback_sql(params, ctx);
            }
            _ => return Ok(None),
        };
        inverse.forward_sql(ctx).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct GrantSelect;

    impl CustomChange for GrantSelect {
        fn forward_sql(&self, params: &Map<String, Value>, ctx: &SqlContext<'_>) -> Result<Vec<String>> {
            let table = params
                .get("table")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::validation("grant requires 'table'"))?;
            Ok(vec![format!("COMMENT ON TABLE {} IS 'readable'", ctx.qualify(None, table))])
        }
    }

    fn parse_change(value: Value) -> Change {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_create_table_sql() {
        let registry = ChangeRegistry::new();
        let ctx = SqlContext::new(None, &registry);
        let change = parse_change(json!({
            "createTable": {
                "tableName": "users",
                "columns": [
                    {"name": "id", "type": "INTEGER", "constraints": {"primaryKey": true}},
                    {"name": "email", "type": "VARCHAR", "constraints": {"nullable": false, "unique": true}},
                    {"name": "active", "type": "BOOLEAN", "defaultValue": true}
                ]
            }
        }));

        let sql = change.forward_sql(&ctx).unwrap();
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE \"users\" (\"id\" INTEGER PRIMARY KEY, \"email\" VARCHAR NOT NULL UNIQUE, \"active\" BOOLEAN DEFAULT TRUE)"
            ]
        );
    }

    #[test]
    fn test_default_schema_qualifies_names() {
        let registry = ChangeRegistry::new();
        let ctx = SqlContext::new(Some("app"), &registry);
        let change = parse_change(json!({"dropTable": {"tableName": "users"}}));
        assert_eq!(change.forward_sql(&ctx).unwrap(), vec!["DROP TABLE \"app\".\"users\""]);

        let explicit = parse_change(json!({"dropTable": {"schemaName": "audit", "tableName": "log"}}));
        assert_eq!(explicit.forward_sql(&ctx).unwrap(), vec!["DROP TABLE \"audit\".\"log\""]);
    }

    #[test]
    fn test_insert_escapes_literals() {
        let registry = ChangeRegistry::new();
        let ctx = SqlContext::new(None, &registry);
        let change = parse_change(json!({
            "insert": {
                "tableName": "notes",
                "columns": [
                    {"name": "id", "value": 1},
                    {"name": "body", "value": "it's here"},
                    {"name": "extra", "value": null}
                ]
            }
        }));
        assert_eq!(
            change.forward_sql(&ctx).unwrap(),
            vec!["INSERT INTO \"notes\" (\"id\", \"body\", \"extra\") VALUES (1, 'it''s here', NULL)"]
        );
    }

    #[test]
    fn test_rollback_inverses() {
        let registry = ChangeRegistry::new();
        let ctx = SqlContext::new(None, &registry);

        let rename = parse_change(json!({
            "renameColumn": {"tableName": "t", "oldColumnName": "a", "newColumnName": "b"}
        }));
        assert_eq!(
            rename.rollback_sql(&ctx).unwrap(),
            Some(vec!["ALTER TABLE \"t\" RENAME COLUMN \"b\" TO \"a\"".to_string()])
        );

        let add = parse_change(json!({
            "addColumn": {"tableName": "t", "columns": [
                {"name": "x", "type": "INT"}, {"name": "y", "type": "INT"}
            ]}
        }));
        assert_eq!(
            add.rollback_sql(&ctx).unwrap(),
            Some(vec![
                "ALTER TABLE \"t\" DROP COLUMN \"y\"".to_string(),
                "ALTER TABLE \"t\" DROP COLUMN \"x\"".to_string(),
            ])
        );

        let raw = parse_change(json!({"sql": {"sql": "DELETE FROM t"}}));
        assert_eq!(raw.rollback_sql(&ctx).unwrap(), None);
    }

    #[test]
    fn test_custom_change_uses_registry() {
        let mut registry = ChangeRegistry::new();
        registry.register("grantSelect", GrantSelect);
        let ctx = SqlContext::new(None, &registry);

        let change = parse_change(json!({"custom": {"name": "grantSelect", "params": {"table": "users"}}}));
        assert_eq!(
            change.forward_sql(&ctx).unwrap(),
            vec!["COMMENT ON TABLE \"users\" IS 'readable'"]
        );
        assert_eq!(change.rollback_sql(&ctx).unwrap(), None);

        let unknown = parse_change(json!({"custom": {"name": "nope"}}));
        assert!(unknown.forward_sql(&ctx).is_err());
    }
}
