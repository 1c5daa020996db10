//! SQL syntax checks for `validate`

use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

/// Parse SQL with the DuckDB dialect, returning a cleaned-up error message
///
/// Only used to warn: the dialect parser is stricter than DuckDB itself in
/// places, so a failure here never blocks an update.
pub fn check_sql_syntax(sql: &str) -> Result<(), String> {
    let dialect = DuckDbDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| {
        let msg = e.to_string();
        msg.trim_start_matches("sql parser error: ").to_string()
    })?;
    Ok(())
}
