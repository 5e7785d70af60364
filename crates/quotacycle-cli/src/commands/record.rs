//! Record command
//!
//! Primes a freshly built tracker with the quota's latest stored snapshot,
//! stores the new reading, then runs it through the tracker. Each invocation
//! is a separate process, so snapshot history is the only memory of the
//! previous reading.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use quotacycle_core::services::quota::CycleStore;
use quotacycle_core::{ProviderKind, QuotaKey, QuotaReading, QuotaTracker, TrackOutcome};
use tabled::Tabled;

use super::{parse_timestamp, Context};
use crate::output::{cell_time, cell_value};

#[derive(Args)]
pub struct RecordArgs {
    /// Provider (anthropic, codex, synthetic, zai, copilot, antigravity, minimax)
    pub provider: ProviderKind,

    /// Quota key, e.g. five_hour
    pub quota: String,

    /// Current usage value in the provider's unit
    pub value: f64,

    /// Provider-reported next reset (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    pub expected_reset: Option<DateTime<Utc>>,

    /// Capture time (RFC 3339); defaults to now
    #[arg(long, value_parser = parse_timestamp)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// Outcome row for table display
#[derive(Debug, Tabled)]
pub struct OutcomeRow {
    #[tabled(rename = "Quota")]
    pub quota: String,
    #[tabled(rename = "Outcome")]
    pub outcome: String,
    #[tabled(rename = "Peak")]
    pub peak: String,
    #[tabled(rename = "Delta")]
    pub delta: String,
    #[tabled(rename = "Reason")]
    pub reason: String,
    #[tabled(rename = "Next Reset")]
    pub next_reset: String,
}

impl OutcomeRow {
    fn new(key: &QuotaKey, reading: &QuotaReading, outcome: &TrackOutcome) -> Self {
        match outcome {
            TrackOutcome::Created { .. } => Self {
                quota: key.to_string(),
                outcome: "created".to_string(),
                peak: cell_value(reading.value),
                delta: cell_value(0.0),
                reason: "-".to_string(),
                next_reset: cell_time(reading.expected_reset),
            },
            TrackOutcome::Updated {
                peak_value,
                cumulative_delta,
            } => Self {
                quota: key.to_string(),
                outcome: "updated".to_string(),
                peak: cell_value(*peak_value),
                delta: cell_value(*cumulative_delta),
                reason: "-".to_string(),
                next_reset: cell_time(reading.expected_reset),
            },
            TrackOutcome::Reset(event) => Self {
                quota: key.to_string(),
                outcome: "reset".to_string(),
                peak: cell_value(event.closed_peak),
                delta: cell_value(event.closed_delta),
                reason: event.reason.to_string(),
                next_reset: cell_time(event.new_expected_reset),
            },
        }
    }
}

pub async fn execute(ctx: &Context, args: RecordArgs) -> Result<()> {
    let key = QuotaKey::new(args.provider, args.quota);
    let captured_at = args.captured_at.unwrap_or_else(Utc::now);
    let reading = QuotaReading::new(key.clone(), args.value, captured_at)
        .with_optional_reset(args.expected_reset)
        .truncated();

    let mut tracker = QuotaTracker::from_config(args.provider, ctx.store.clone(), &ctx.config);
    match ctx.store.query_latest_snapshot(&key).await? {
        Some(previous) if previous.captured_at <= reading.captured_at => {
            log::debug!(
                "Priming {} with snapshot from {}",
                key,
                cell_time(Some(previous.captured_at))
            );
            tracker.prime(&key.quota, &previous);
        }
        _ => {}
    }

    ctx.store.insert_snapshot(&reading).await?;
    let outcome = tracker.process(&reading).await?;

    if let TrackOutcome::Reset(event) = &outcome {
        ctx.out.reset_banner(event);
    }

    ctx.out
        .emit(&outcome, &[OutcomeRow::new(&key, &reading, &outcome)])
}
