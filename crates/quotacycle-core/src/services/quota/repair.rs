//! Cycle repair
//!
//! Finds closed cycles whose duration is implausible for their quota (two or
//! more real cycles merged because a reset was missed while offline) and
//! splits them along reset boundaries reconstructed from snapshot history.
//!
//! The pass is gated by a completion flag in `settings`, so calling
//! [`CycleRepairEngine::repair_if_needed`] on every start is a no-op after the
//! first successful run.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::Result;

use super::config::{BoundaryRules, TuningConfig};
use super::store::CycleStore;
use super::types::{
    Cycle, CycleReplacement, NewCycle, ProviderKind, QuotaKey, SnapshotPoint, ValueUnit,
};

/// Settings key marking the repair pass as done
pub const REPAIR_FLAG_KEY: &str = "cycle_repair_v2";

/// Settings value marking the repair pass as done
pub const REPAIR_FLAG_DONE: &str = "completed";

// ============================================================================
// Results
// ============================================================================

/// Outcome of repairing one quota
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairResult {
    pub provider: ProviderKind,
    pub quota_key: String,
    /// Closed cycles longer than the quota's threshold
    pub cycles_examined: usize,
    /// Bad cycles replaced by split cycles
    pub cycles_fixed: usize,
    /// Cycles inserted in place of the fixed ones
    pub cycles_created: usize,
    /// Bad cycles left as-is (too few snapshots or no boundary found)
    pub cycles_skipped: usize,
    pub snapshots_used: usize,
}

impl RepairResult {
    fn new(key: &QuotaKey) -> Self {
        Self {
            provider: key.provider,
            quota_key: key.quota.clone(),
            cycles_examined: 0,
            cycles_fixed: 0,
            cycles_created: 0,
            cycles_skipped: 0,
            snapshots_used: 0,
        }
    }
}

// ============================================================================
// Boundary detection
// ============================================================================

/// A reset found inside snapshot history
#[derive(Debug, Clone, PartialEq)]
pub struct ResetBoundary {
    /// Capture time of the first reading after the reset
    pub at: DateTime<Utc>,
    /// Expected reset to carry into the following cycle
    pub expected_reset: Option<DateTime<Utc>>,
}

/// Scan consecutive snapshot pairs for reset boundaries
///
/// Checks, in order: expected reset moved beyond jitter, appeared,
/// disappeared, a material value drop, then a long gap with any drop.
/// With `shift_requires_drop` the expected-reset checks also need the value
/// to decrease. At most one boundary is recorded per pair.
pub fn find_reset_boundaries(
    points: &[SnapshotPoint],
    unit: ValueUnit,
    rules: &BoundaryRules,
) -> Vec<ResetBoundary> {
    let jitter = Duration::minutes(rules.jitter_minutes);
    let gap = Duration::minutes(rules.gap_minutes);

    points
        .windows(2)
        .filter_map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);

            let inferred = match (prev.expected_reset, cur.expected_reset) {
                (Some(before), Some(after)) if (after - before).abs() > jitter => Some(Some(after)),
                (None, Some(after)) => Some(Some(after)),
                (Some(before), None) => Some(Some(before)),
                _ => None,
            }
            .filter(|_| !rules.shift_requires_drop || cur.value < prev.value);

            let inferred = inferred.or_else(|| {
                let dropped = unit.is_material_drop(prev.value, cur.value, rules.material_drop)
                    || (cur.captured_at - prev.captured_at > gap && cur.value < prev.value);
                dropped.then_some(prev.expected_reset)
            })?;

            Some(ResetBoundary {
                at: cur.captured_at,
                expected_reset: inferred,
            })
        })
        .collect()
}

/// Peak and summed positive steps over a run of points
pub fn cycle_stats(points: &[SnapshotPoint]) -> (f64, f64) {
    let peak = points.iter().map(|p| p.value).fold(0.0, f64::max);
    let delta: f64 = points
        .windows(2)
        .map(|pair| (pair[1].value - pair[0].value).max(0.0))
        .sum();
    (peak, delta)
}

/// Points captured in `[start, end)`
fn points_in(points: &[SnapshotPoint], start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SnapshotPoint> {
    points
        .iter()
        .filter(|p| p.captured_at >= start && p.captured_at < end)
        .cloned()
        .collect()
}

/// Replacement cycles for one bad cycle, or `None` if nothing splits it
///
/// Only boundaries strictly inside the cycle count; a cycle with none is left
/// alone rather than rewritten.
pub fn split_cycle(
    cycle: &Cycle,
    points: &[SnapshotPoint],
    unit: ValueUnit,
    rules: &BoundaryRules,
) -> Option<Vec<NewCycle>> {
    let end = cycle.cycle_end?;
    let boundaries: Vec<ResetBoundary> = find_reset_boundaries(points, unit, rules)
        .into_iter()
        .filter(|b| b.at > cycle.cycle_start && b.at < end)
        .collect();

    if boundaries.is_empty() {
        return None;
    }

    let mut segments = Vec::with_capacity(boundaries.len() + 1);
    let mut seg_start = cycle.cycle_start;
    let mut carried: Option<DateTime<Utc>> = None;

    let edges = boundaries
        .iter()
        .map(|b| (b.at, b.expected_reset))
        .chain(std::iter::once((end, None)));

    for (seg_end, next_reset) in edges {
        if seg_end <= seg_start {
            continue;
        }
        let within = points_in(points, seg_start, seg_end);
        let (peak_value, cumulative_delta) = cycle_stats(&within);
        let expected_reset = within
            .iter()
            .rev()
            .find_map(|p| p.expected_reset)
            .or(carried);

        segments.push(NewCycle {
            start: seg_start,
            end: Some(seg_end),
            expected_reset,
            peak_value,
            cumulative_delta,
        });

        seg_start = seg_end;
        carried = next_reset;
    }

    (segments.len() >= 2).then_some(segments)
}

// ============================================================================
// Engine
// ============================================================================

/// Retroactive splitter for merged cycles
pub struct CycleRepairEngine {
    store: Arc<dyn CycleStore>,
    config: TuningConfig,
}

impl CycleRepairEngine {
    pub fn new(store: Arc<dyn CycleStore>, config: TuningConfig) -> Self {
        Self { store, config }
    }

    /// Whether a previous pass completed
    pub async fn is_completed(&self) -> Result<bool> {
        Ok(self.store.get_setting(REPAIR_FLAG_KEY).await?.as_deref() == Some(REPAIR_FLAG_DONE))
    }

    /// Run the repair pass unless it already completed
    pub async fn repair_if_needed(&self) -> Result<Vec<RepairResult>> {
        if self.is_completed().await? {
            log::debug!("[quota:repair] Cycle repair already completed, skipping");
            return Ok(Vec::new());
        }
        self.force_repair().await
    }

    /// Run the repair pass regardless of the completion flag
    pub async fn force_repair(&self) -> Result<Vec<RepairResult>> {
        log::info!("[quota:repair] Scanning for merged cycles...");

        let mut results = Vec::new();
        for provider in ProviderKind::ALL {
            let quotas = self
                .store
                .query_quota_keys(provider)
                .await
                .map_err(|e| e.in_quota(provider, "list quota keys"))?;

            for quota in quotas {
                let key = QuotaKey::new(provider, quota);
                if let Some(result) = self.repair_quota(&key).await? {
                    results.push(result);
                }
            }
        }

        self.store
            .set_setting(REPAIR_FLAG_KEY, REPAIR_FLAG_DONE)
            .await?;

        let fixed: usize = results.iter().map(|r| r.cycles_fixed).sum();
        let created: usize = results.iter().map(|r| r.cycles_created).sum();
        log::info!(
            "[quota:repair] Cycle repair completed: {} quotas examined, {} cycles fixed, {} created",
            results.len(),
            fixed,
            created
        );

        Ok(results)
    }

    /// Repair one quota; `None` when it has no implausible cycles
    pub async fn repair_quota(&self, key: &QuotaKey) -> Result<Option<RepairResult>> {
        let policy = self.config.policy(key.provider);
        let Some(max_duration) = policy.max_cycle_duration(&key.quota) else {
            return Ok(None);
        };
        let rules = self.config.boundaries_for(key.provider);

        let history = self
            .store
            .query_cycle_history(key, None)
            .await
            .map_err(|e| e.in_quota(key, "query cycle history"))?;

        // History is newest first; repair oldest first
        let bad: Vec<&Cycle> = history
            .iter()
            .rev()
            .filter(|c| c.duration().is_some_and(|d| d > max_duration))
            .collect();

        if bad.is_empty() {
            return Ok(None);
        }

        log::info!(
            "[quota:repair] {} has {} cycles longer than {}h",
            key,
            bad.len(),
            max_duration.num_hours()
        );

        let mut result = RepairResult::new(key);
        result.cycles_examined = bad.len();
        let mut replacements = Vec::new();

        for cycle in bad {
            let Some(end) = cycle.cycle_end else {
                continue;
            };
            let points = self
                .store
                .query_snapshots_in_range(key, cycle.cycle_start, end)
                .await
                .map_err(|e| e.in_quota(key, "query snapshots"))?;
            result.snapshots_used += points.len();

            if points.len() < 2 {
                log::info!(
                    "[quota:repair] Not enough snapshots to split cycle {} of {} ({})",
                    cycle.id,
                    key,
                    points.len()
                );
                result.cycles_skipped += 1;
                continue;
            }

            match split_cycle(cycle, &points, policy.unit, &rules) {
                Some(segments) => {
                    log::info!(
                        "[quota:repair] Splitting cycle {} of {} into {} cycles",
                        cycle.id,
                        key,
                        segments.len()
                    );
                    result.cycles_fixed += 1;
                    result.cycles_created += segments.len();
                    replacements.push(CycleReplacement {
                        bad_cycle_id: cycle.id,
                        replacements: segments,
                    });
                }
                None => {
                    log::debug!(
                        "[quota:repair] No reset boundaries found in cycle {} of {}",
                        cycle.id,
                        key
                    );
                    result.cycles_skipped += 1;
                }
            }
        }

        if !replacements.is_empty() {
            self.store
                .replace_cycles(key, &replacements)
                .await
                .map_err(|e| e.in_quota(key, "replace cycles"))?;
        }

        Ok(Some(result))
    }
}

// ============================================================================
// Tests
// ============================================================================
