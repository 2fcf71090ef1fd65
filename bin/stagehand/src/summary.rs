//! Terminal tables for plans and run reports.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL};
use stagehand_deploy::{Gate, PipelineStage, RunReport, StageOutcome};

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

/// One row per stage with the gate decision.
pub fn plan_table(plan: &[(&PipelineStage, Gate)]) -> Table {
    let mut table = table(&["Stage", "Mode", "Decision", "Reason"]);
    for (stage, gate) in plan {
        let (decision, reason) = match gate {
            Gate::Run => (Cell::new("run").fg(Color::Green), String::new()),
            Gate::Skip(reason) => (Cell::new("skip").fg(Color::Yellow), reason.to_string()),
        };
        table.add_row(vec![
            Cell::new(&stage.definition.id),
            Cell::new(stage.definition.mode),
            decision,
            Cell::new(reason),
        ]);
    }
    table
}

/// One row per evaluated stage with its terminal status.
pub fn run_table(report: &RunReport) -> Table {
    let mut table = table(&["Stage", "Status", "Detail"]);
    for stage in &report.stages {
        let status = stage.outcome.status();
        let (color, detail) = match &stage.outcome {
            StageOutcome::Succeeded => (
                Color::Green,
                stage
                    .provisioned
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            StageOutcome::Skipped(reason) => (Color::Yellow, reason.to_string()),
            StageOutcome::Failed(e) => (Color::Red, e.to_string()),
        };
        table.add_row(vec![
            Cell::new(&stage.stage),
            Cell::new(status).fg(color),
            Cell::new(detail),
        ]);
    }
    table
}

/// One row per published parameter.
pub fn outputs_table(report: &RunReport) -> Option<Table> {
    if report.outputs.is_empty() {
        return None;
    }
    let mut table = table(&["Parameter", "Value"]);
    for (name, value) in report.outputs.iter() {
        table.add_row(vec![name, value]);
    }
    Some(table)
}
