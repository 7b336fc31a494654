use anyhow::Result;
use console::style;

use super::process::print_snapshot;
use super::session::Session;
use crate::core::dataset::{LabelPayload, Sample};
use crate::core::terminal::{PENCIL, print_info, print_status, print_success, print_warn};

pub async fn show_next(session: &Session) -> Result<()> {
    let controller = session.controller().await?;
    let snapshot = controller.snapshot();
    if snapshot.finished {
        print_info("The run is complete. Nothing left to review.");
        return Ok(());
    }
    match controller.next_for_review().await? {
        Some(sample) => print_proposal(&sample),
        None => print_info("No proposal is waiting for review. Try `labelloop run`."),
    }
    Ok(())
}

pub async fn record_decision(
    session: &Session,
    sample_id: &str,
    accept: bool,
    annotator: &str,
) -> Result<()> {
    let controller = session.controller().await?;
    let sample = controller.validate_sample(sample_id, accept, annotator).await?;
    print_success(&format!(
        "Sample {} {}.",
        sample.id,
        if accept { "accepted" } else { "rejected" }
    ));

    // Completing the iteration may start the next one in the background.
    controller.wait_idle().await;
    let snapshot = controller.snapshot();
    print_snapshot(&snapshot);
    if snapshot.finished {
        print_success("All iterations are done. See `labelloop report`.");
    } else if controller.next_for_review().await?.is_none() {
        print_warn("Nothing left to review in this iteration.");
    }
    Ok(())
}

fn print_proposal(sample: &Sample) {
    println!("{} {}", PENCIL, style(&sample.id).bold().cyan());
    println!("   {}", sample.text);
    match sample.annotation.as_ref().map(|a| &a.payload) {
        Some(payload) => print_status("Proposal", &describe(payload, &sample.text)),
        None => print_status("Proposal", "none"),
    }
    println!(
        "\n   {} labelloop validate --sample {} --accept | --reject\n",
        style("Decide with:").dim(),
        sample.id
    );
}

pub(crate) fn describe(payload: &LabelPayload, text: &str) -> String {
    match payload {
        LabelPayload::Classification { label } => label.clone(),
        LabelPayload::SequenceLabeling { spans } if spans.is_empty() => "no spans".to_string(),
        LabelPayload::SequenceLabeling { spans } => spans
            .iter()
            .map(|span| {
                let surface = text.get(span.start..span.end).unwrap_or("?");
                format!("{} [{}..{}] {}", surface, span.start, span.end, span.label)
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::Span;

    #[test]
    fn describes_spans_with_surface_text() {
        let payload = LabelPayload::SequenceLabeling {
            spans: vec![Span::new(0, 5, "CITY"), Span::new(10, 99, "ORG")],
        };
        assert_eq!(
            describe(&payload, "Paris and Acme"),
            "Paris [0..5] CITY, ? [10..99] ORG"
        );
        let empty = LabelPayload::SequenceLabeling { spans: vec![] };
        assert_eq!(describe(&empty, "x"), "no spans");
        let class = LabelPayload::Classification {
            label: "spam".into(),
        };
        assert_eq!(describe(&class, "x"), "spam");
    }
}
