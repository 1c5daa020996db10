//! Output formatting utilities

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};

use changeline_core::{ExecutionReport, OutcomeStatus};

/// Print a success message
pub fn success(msg: &str) {
    println!("{}", msg.green());
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{}", msg.red());
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{}", msg.yellow());
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{}", msg.cyan());
}

/// Create a styled table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_label(status: OutcomeStatus) -> String {
    match status {
        OutcomeStatus::Executed => "executed".green().to_string(),
        OutcomeStatus::Reran => "reran".green().to_string(),
        OutcomeStatus::MarkRan => "mark ran".cyan().to_string(),
        OutcomeStatus::Skipped => "skipped".yellow().to_string(),
        OutcomeStatus::Failed => "failed".red().to_string(),
        OutcomeStatus::RolledBack => "rolled back".cyan().to_string(),
    }
}

/// Table of per-changeset outcomes
pub fn print_report(report: &ExecutionReport) {
    if report.outcomes.is_empty() {
        return;
    }
    let mut table = create_table();
    table.set_header(vec!["Changeset", "Result", "Time", "Error"]);
    for outcome in &report.outcomes {
        table.add_row(vec![
            outcome.changeset.to_string(),
            status_label(outcome.status),
            format_duration(outcome.duration_ms),
            outcome.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
}

/// Format milliseconds as a short human-readable duration
pub fn format_duration(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    } else if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}
