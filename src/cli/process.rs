use anyhow::Result;

use super::session::Session;
use crate::core::metrics::MetricReport;
use crate::core::orchestrator::{IterationSnapshot, StartOutcome};
use crate::core::terminal::{print_info, print_status, print_step, print_success, print_warn};

pub async fn run_loop(session: &Session) -> Result<()> {
    let controller = session.controller().await?;
    print_step("Driving the labeling loop...");
    match controller.run_until_idle().await? {
        StartOutcome::Started => print_info("Started a new run."),
        StartOutcome::Resumed => print_info("Resumed the previous run."),
        StartOutcome::AlreadyRunning => print_warn("Another driver is already running."),
        StartOutcome::AlreadyComplete => print_info("The run is already complete."),
    }

    let snapshot = controller.snapshot();
    print_snapshot(&snapshot);
    if snapshot.finished {
        if let Some(report) = controller.metric_report().await? {
            print_report(&report);
        }
    } else if snapshot.waiting_for_review() {
        print_info("Proposals are waiting. Use `labelloop review` and `labelloop validate`.");
    }
    Ok(())
}

pub async fn show_status(session: &Session, json: bool) -> Result<()> {
    let controller = session.controller().await?;
    let snapshot = controller.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

pub async fn show_report(session: &Session) -> Result<()> {
    match session.store.latest_metric_report().await? {
        Some(report) => print_report(&report),
        None => print_warn("No metric report yet. The run has not been finalized."),
    }
    Ok(())
}

pub(super) fn print_snapshot(snapshot: &IterationSnapshot) {
    let status = match (snapshot.finished, snapshot.status) {
        (true, _) => "finished".to_string(),
        (false, Some(status)) => status.to_string(),
        (false, None) => "not started".to_string(),
    };
    print_status("Status", &status);
    print_status("Iteration", &snapshot.position.to_string());
    if let Some(id) = &snapshot.iteration_id {
        print_status("Iteration id", id);
    }
    print_status("Samples", &snapshot.sample_count.to_string());
}

fn print_report(report: &MetricReport) {
    print_success(&format!(
        "Metrics over {} golden samples ({})",
        report.golden_size,
        report.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if report.values.is_empty() {
        print_warn("No metric could be computed on an empty golden set.");
    }
    for (name, value) in &report.values {
        print_status(name, &format!("{:.4}", value));
    }
}
