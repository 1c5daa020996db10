//! Lock commands - inspect and clear the migration lock

use anyhow::Result;
use colored::Colorize;

use changeline_core::LogEvent;

use super::{confirm, get_logger, load_config, log_event, open_facade, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, json: bool) -> Result<()> {
    let config = load_config(global)?;
    let mut facade = open_facade(global, &config)?;
    let status = facade.list_locks()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match &status.record {
        Some(record) => {
            let mut table = output::create_table();
            table.set_header(vec!["Held By", "Since"]);
            table.add_row(vec![
                record.locked_by.clone(),
                record.locked_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ]);
            println!("{}", "Migration lock is held".yellow().bold());
            println!("{}", table);
        }
        None => output::success("Migration lock is free"),
    }
    Ok(())
}

pub fn run_release(global: &GlobalArgs, force: bool, json: bool) -> Result<()> {
    let config = load_config(global)?;
    let mut facade = open_facade(global, &config)?;

    let Some(record) = facade.list_locks()?.record else {
        if json {
            println!("{}", serde_json::json!({ "released": false }));
        } else {
            output::info("Migration lock is not held");
        }
        return Ok(());
    };

    output::warning(&format!(
        "Lock held by {} since {}. Releasing it while a migration runs can corrupt the schema.",
        record.locked_by, record.locked_at
    ));
    if !confirm("Release the migration lock?", force, json)? {
        println!("Cancelled.");
        return Ok(());
    }

    let released = facade.force_release_locks()?;
    log_event(
        &get_logger(global),
        LogEvent::new("lock_released")
            .with_command("release-locks")
            .with_error_details(format!("held by {}", record.locked_by)),
    );

    if json {
        println!("{}", serde_json::json!({ "released": released }));
    } else if released {
        output::success("Released migration lock");
    } else {
        output::info("Migration lock was already free");
    }
    Ok(())
}
