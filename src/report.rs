//! Profile reports: run metadata plus the ranked summary, as JSON or Markdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{FailureKind, PipelineRun, RunStopReason};
use crate::summary::{reduce, RankedSummary, RankedView, SummaryConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRow {
    pub index: usize,
    pub source: String,
    pub kind: FailureKind,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stop_reason: RunStopReason,
    pub latency_ms: u64,
    pub summary: RankedSummary,
    pub failures: Vec<FailureRow>,
}

pub fn build_report(run: &PipelineRun, config: &SummaryConfig) -> ProfileReport {
    let failures = run
        .items
        .iter()
        .flat_map(|item| {
            item.outcome.failures().into_iter().map(|f| FailureRow {
                index: item.index,
                source: item.source.clone(),
                kind: f.kind,
                code: f.code.clone(),
                reason: f.reason.clone(),
            })
        })
        .collect();

    ProfileReport {
        run_id: run.run_id,
        started_at: run.started_at,
        stop_reason: run.stop_reason,
        latency_ms: run.latency_ms,
        summary: reduce(&run.state, config),
        failures,
    }
}

fn push_view(out: &mut String, title: &str, view: &RankedView) {
    if view.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {title}\n\n"));
    for entry in &view.entries {
        out.push_str(&format!(
            "- {} ({} of {}, {:.1}%)\n",
            entry.value, entry.count, view.contributors, entry.share
        ));
    }
}

/// Markdown rendering of a ranked summary. Empty views are omitted.
pub fn render_markdown(summary: &RankedSummary) -> String {
    let mut out = String::new();
    out.push_str("# Style Profile\n\n");
    out.push_str(&summary.narrative);
    out.push('\n');
    out.push_str(&format!(
        "\n- Items attempted/succeeded/cancelled: {}/{}/{}\n",
        summary.items_attempted, summary.items_succeeded, summary.items_cancelled
    ));

    push_view(&mut out, "Color palette", &summary.colors);
    for view in &summary.fields {
        let title = crate::annotation::AnnotationField::from_key(&view.field)
            .map(|f| f.title())
            .unwrap_or(view.field.as_str());
        push_view(&mut out, title, view);
    }
    out
}

pub fn render_report_markdown(report: &ProfileReport) -> String {
    let mut out = render_markdown(&report.summary);
    out.push_str("\n## Run\n\n");
    out.push_str(&format!("- Run ID: `{}`\n", report.run_id));
    out.push_str(&format!("- Started: {}\n", report.started_at.to_rfc3339()));
    out.push_str(&format!("- Stop reason: {:?}\n", report.stop_reason));
    out.push_str(&format!("- Latency: {} ms\n", report.latency_ms));

    if !report.failures.is_empty() {
        out.push_str("\n## Failures\n\n");
        for f in &report.failures {
            out.push_str(&format!(
                "- #{} {} [{}/{}]: {}\n",
                f.index,
                f.source,
                f.kind.as_str(),
                f.code,
                f.reason
            ));
        }
    }
    out
}
