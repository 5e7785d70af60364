//! Summary command

use anyhow::Result;
use quotacycle_core::{ProviderKind, QuotaKey, UsageSummarizer, UsageSummary};
use tabled::Tabled;

use super::Context;
use crate::output::{cell_countdown, cell_time, cell_value};

/// Summary field row for table display
#[derive(Debug, Tabled)]
pub struct FieldRow {
    #[tabled(rename = "Field")]
    pub field: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

fn row(field: &str, value: String) -> FieldRow {
    FieldRow {
        field: field.to_string(),
        value,
    }
}

fn summary_rows(summary: &UsageSummary) -> Vec<FieldRow> {
    vec![
        row("Quota", format!("{}/{}", summary.provider, summary.quota_key)),
        row("Completed cycles", summary.completed_cycles.to_string()),
        row("Average per cycle", cell_value(summary.avg_per_cycle)),
        row("Peak cycle usage", cell_value(summary.peak_cycle_delta)),
        row("Peak value", cell_value(summary.peak_value)),
        row("Total tracked", cell_value(summary.total_tracked)),
        row("Current value", cell_value(summary.current_value)),
        row("Cycle start", cell_time(summary.cycle_start)),
        row("Expected reset", cell_time(summary.expected_reset)),
        row("Time until reset", cell_countdown(summary.seconds_until_reset)),
        row("Rate per hour", cell_value(summary.current_rate)),
        row(
            "Projected at reset",
            summary
                .projected_value
                .map(cell_value)
                .unwrap_or_else(|| "-".to_string()),
        ),
        row("Tracking since", cell_time(summary.tracking_since)),
    ]
}

pub async fn execute(ctx: &Context, provider: ProviderKind, quota: String) -> Result<()> {
    let key = QuotaKey::new(provider, quota);
    let summarizer = UsageSummarizer::new(ctx.store.clone(), ctx.config.clone());
    let summary = summarizer.summarize(&key).await?;

    ctx.out.emit(&summary, &summary_rows(&summary))
}
