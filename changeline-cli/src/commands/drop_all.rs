//! Drop-all command - empty the target schema

use anyhow::Result;

use changeline_core::LogEvent;

use super::{confirm, get_logger, load_config, log_event, open_facade, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, force: bool, json: bool) -> Result<()> {
    let config = load_config(global)?;
    let target = config.database.as_deref().unwrap_or(":memory:");
    if !confirm(
        &format!("Drop every object in {}? This cannot be undone", target),
        force,
        json,
    )? {
        println!("Cancelled.");
        return Ok(());
    }

    let logger = get_logger(global);
    let mut facade = open_facade(global, &config)?;
    let report = match facade.drop_all() {
        Ok(report) => report,
        Err(e) => {
            log_event(
                &logger,
                LogEvent::new("drop_all_failed")
                    .with_command("drop-all")
                    .with_error(e.to_string()),
            );
            return Err(e.into());
        }
    };
    log_event(&logger, LogEvent::new("drop_all_completed").with_command("drop-all"));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for object in &report.dropped {
        println!("  • {}", object);
    }
    output::success(&format!("Dropped {} objects", report.dropped.len()));
    Ok(())
}
