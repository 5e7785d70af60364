//! Usage summaries
//!
//! Read-only reporting view combining closed-cycle history, the active cycle
//! and the latest snapshot for one quota.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::Result;

use super::config::TuningConfig;
use super::store::CycleStore;
use super::types::{Cycle, ProviderKind, QuotaKey, SnapshotPoint, ValueUnit};

/// Minimum active-cycle age before a rate is reported
pub const MIN_PROJECTION_MINUTES: i64 = 30;

/// Reporting summary for one quota
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub provider: ProviderKind,
    pub quota_key: String,
    pub completed_cycles: usize,
    /// Average cumulative delta per completed cycle
    pub avg_per_cycle: f64,
    /// Largest cumulative delta of a completed cycle
    pub peak_cycle_delta: f64,
    /// Largest peak value across completed and active cycles
    pub peak_value: f64,
    /// Completed deltas plus the active cycle's delta
    pub total_tracked: f64,
    pub current_value: f64,
    pub expected_reset: Option<DateTime<Utc>>,
    pub seconds_until_reset: Option<i64>,
    /// Active cycle's delta per hour
    pub current_rate: f64,
    /// Linear end-of-cycle projection, clamped to the unit's ceiling
    pub projected_value: Option<f64>,
    pub tracking_since: Option<DateTime<Utc>>,
    pub cycle_start: Option<DateTime<Utc>>,
}

impl UsageSummary {
    /// Summary for a quota with no data
    pub fn empty(key: &QuotaKey) -> Self {
        Self {
            provider: key.provider,
            quota_key: key.quota.clone(),
            completed_cycles: 0,
            avg_per_cycle: 0.0,
            peak_cycle_delta: 0.0,
            peak_value: 0.0,
            total_tracked: 0.0,
            current_value: 0.0,
            expected_reset: None,
            seconds_until_reset: None,
            current_rate: 0.0,
            projected_value: None,
            tracking_since: None,
            cycle_start: None,
        }
    }
}

/// Assemble a summary from already-loaded data
///
/// `history` is closed cycles newest first, as the store returns them.
pub fn build_summary(
    key: &QuotaKey,
    unit: ValueUnit,
    history: &[Cycle],
    active: Option<&Cycle>,
    latest: Option<&SnapshotPoint>,
    now: DateTime<Utc>,
) -> UsageSummary {
    let mut summary = UsageSummary::empty(key);

    summary.completed_cycles = history.len();
    if !history.is_empty() {
        let total: f64 = history.iter().map(|c| c.cumulative_delta).sum();
        summary.total_tracked = total;
        summary.avg_per_cycle = total / history.len() as f64;
        summary.peak_cycle_delta = history
            .iter()
            .map(|c| c.cumulative_delta)
            .fold(0.0, f64::max);
        summary.peak_value = history.iter().map(|c| c.peak_value).fold(0.0, f64::max);
        summary.tracking_since = history.iter().map(|c| c.cycle_start).min();
    }

    summary.current_value = latest
        .map(|p| p.value)
        .or(active.map(|c| c.peak_value))
        .unwrap_or(0.0);

    let Some(active) = active else {
        return summary;
    };

    summary.total_tracked += active.cumulative_delta;
    summary.peak_value = summary.peak_value.max(active.peak_value);
    summary.cycle_start = Some(active.cycle_start);
    if summary.tracking_since.is_none() {
        summary.tracking_since = Some(active.cycle_start);
    }

    summary.expected_reset = active
        .expected_reset
        .or_else(|| latest.and_then(|p| p.expected_reset));
    summary.seconds_until_reset = summary
        .expected_reset
        .map(|reset| (reset - now).num_seconds().max(0));

    let elapsed = now - active.cycle_start;
    if elapsed >= Duration::minutes(MIN_PROJECTION_MINUTES) && active.cumulative_delta > 0.0 {
        let elapsed_hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        summary.current_rate = active.cumulative_delta / elapsed_hours;

        if let Some(reset) = summary.expected_reset {
            let hours_left = (reset - now).num_milliseconds() as f64 / 3_600_000.0;
            if hours_left > 0.0 {
                let projected = summary.current_value + summary.current_rate * hours_left;
                summary.projected_value = Some(match unit.ceiling() {
                    Some(ceiling) => projected.min(ceiling),
                    None => projected,
                });
            }
        }
    }

    summary
}

/// Builds [`UsageSummary`] values from the store
pub struct UsageSummarizer {
    store: Arc<dyn CycleStore>,
    config: TuningConfig,
}

impl UsageSummarizer {
    pub fn new(store: Arc<dyn CycleStore>, config: TuningConfig) -> Self {
        Self { store, config }
    }

    pub async fn summarize(&self, key: &QuotaKey) -> Result<UsageSummary> {
        self.summarize_at(key, Utc::now()).await
    }

    /// Summary as of `now`
    pub async fn summarize_at(&self, key: &QuotaKey, now: DateTime<Utc>) -> Result<UsageSummary> {
        let active = self
            .store
            .query_active_cycle(key)
            .await
            .map_err(|e| e.in_quota(key, "query active cycle"))?;
        let history = self
            .store
            .query_cycle_history(key, None)
            .await
            .map_err(|e| e.in_quota(key, "query cycle history"))?;
        let latest = self
            .store
            .query_latest_snapshot(key)
            .await
            .map_err(|e| e.in_quota(key, "query latest snapshot"))?;

        let unit = self.config.policy(key.provider).unit;
        Ok(build_summary(
            key,
            unit,
            &history,
            active.as_ref(),
            latest.as_ref(),
            now,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> QuotaKey {
        QuotaKey::new(ProviderKind::Anthropic, "five_hour")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 4, 0, 0, 0).unwrap()
    }

    fn closed(start_h: i64, peak: f64, delta: f64) -> Cycle {
        Cycle {
            id: start_h,
            key: key(),
            cycle_start: t0() + Duration::hours(start_h),
            cycle_end: Some(t0() + Duration::hours(start_h + 5)),
            expected_reset: None,
            peak_value: peak,
            cumulative_delta: delta,
        }
    }

    fn active(start: DateTime<Utc>, reset: Option<DateTime<Utc>>, peak: f64, delta: f64) -> Cycle {
        Cycle {
            id: 99,
            key: key(),
            cycle_start: start,
            cycle_end: None,
            expected_reset: reset,
            peak_value: peak,
            cumulative_delta: delta,
        }
    }

    #[test]
    fn test_empty_summary() {
        let summary = build_summary(&key(), ValueUnit::Percent, &[], None, None, t0());
        assert_eq!(summary, UsageSummary::empty(&key()));
        assert_eq!(summary.completed_cycles, 0);
        assert!(summary.projected_value.is_none());
    }

    #[test]
    fn test_history_statistics() {
        // Newest first
        let history = vec![closed(10, 80.0, 70.0), closed(5, 50.0, 30.0)];
        let summary = build_summary(&key(), ValueUnit::Percent, &history, None, None, t0());
        assert_eq!(summary.completed_cycles, 2);
        assert_eq!(summary.avg_per_cycle, 50.0);
        assert_eq!(summary.peak_cycle_delta, 70.0);
        assert_eq!(summary.peak_value, 80.0);
        assert_eq!(summary.total_tracked, 100.0);
        assert_eq!(summary.tracking_since, Some(t0() + Duration::hours(5)));
    }

    #[test]
    fn test_projection_needs_thirty_minutes() {
        let start = t0();
        let reset = start + Duration::hours(5);
        let cycle = active(start, Some(reset), 10.0, 10.0);
        let early = build_summary(&key(), ValueUnit::Percent, &[], Some(&cycle), None, start + Duration::minutes(29));
        assert_eq!(early.current_rate, 0.0);
        assert!(early.projected_value.is_none());
        assert_eq!(early.tracking_since, Some(start));
    }

    #[test]
    fn test_projection_linear_and_clamped() {
        let start = t0();
        let reset = start + Duration::hours(5);
        let now = start + Duration::hours(1);
        let latest = SnapshotPoint {
            captured_at: now,
            value: 20.0,
            expected_reset: Some(reset),
        };

        let cycle = active(start, Some(reset), 20.0, 10.0);
        let summary = build_summary(&key(), ValueUnit::Percent, &[], Some(&cycle), Some(&latest), now);
        assert_eq!(summary.current_rate, 10.0);
        assert_eq!(summary.projected_value, Some(60.0));
        assert_eq!(summary.seconds_until_reset, Some(4 * 3600));

        let fast = active(start, Some(reset), 20.0, 40.0);
        let summary = build_summary(&key(), ValueUnit::Percent, &[], Some(&fast), Some(&latest), now);
        assert_eq!(summary.projected_value, Some(100.0));

        // Counts have no ceiling
        let summary = build_summary(&key(), ValueUnit::Count, &[], Some(&fast), Some(&latest), now);
        assert_eq!(summary.projected_value, Some(180.0));
    }

    #[test]
    fn test_expected_reset_falls_back_to_latest_snapshot() {
        let start = t0();
        let reset = start + Duration::hours(2);
        let now = start + Duration::hours(3);
        let latest = SnapshotPoint {
            captured_at: now,
            value: 7.0,
            expected_reset: Some(reset),
        };
        let cycle = active(start, None, 7.0, 0.0);
        let summary = build_summary(&key(), ValueUnit::Percent, &[], Some(&cycle), Some(&latest), now);
        assert_eq!(summary.expected_reset, Some(reset));
        // Already passed: clamp at zero
        assert_eq!(summary.seconds_until_reset, Some(0));
        assert_eq!(summary.current_value, 7.0);
    }
}
