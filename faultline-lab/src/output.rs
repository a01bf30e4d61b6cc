//! Output formatting for the lab

use anyhow::Result;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use crate::commands::simulate::SimulationReport;

pub fn print_report(report: &SimulationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let stats = &report.stats;
    let state = report
        .circuit_state
        .map(|s| format!("{s:?}"))
        .unwrap_or_else(|| "-".to_string());

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_header(vec![
        Cell::new("Metric").fg(Color::Cyan),
        Cell::new("Value").fg(Color::Cyan),
    ]);

    let rows: [(&str, String); 12] = [
        ("Command", report.command.to_string()),
        ("Invocations", stats.invocations.to_string()),
        ("Succeeded", stats.succeeded.to_string()),
        ("Served by fallback", stats.fallback_succeeded.to_string()),
        ("Failed", stats.failed.to_string()),
        ("Retries", stats.retries.to_string()),
        ("Timed out", stats.timed_out.to_string()),
        ("Prevented by circuit", stats.prevented.to_string()),
        ("Circuit opened", stats.circuit_opened.to_string()),
        ("Bulkhead rejections", stats.bulkhead_rejected.to_string()),
        ("Mean elapsed", format!("{:?}", stats.mean_elapsed())),
        ("Circuit state", state),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    println!("{table}");

    if !report.errors.is_empty() {
        let mut errors = Table::new();
        errors.load_preset(UTF8_FULL);
        errors.apply_modifier(UTF8_ROUND_CORNERS);
        errors.set_header(vec![
            Cell::new("Error kind").fg(Color::Red),
            Cell::new("Count").fg(Color::Red),
        ]);
        for (kind, count) in &report.errors {
            errors.add_row(vec![Cell::new(kind), Cell::new(count)]);
        }
        println!("{errors}");
    }
    Ok(())
}
