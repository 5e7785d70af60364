//! Quota tracker
//!
//! Online state machine turning a stream of readings for one provider into
//! reset cycles. One tracker instance serves every quota of its provider and
//! is driven by a single poll loop, so `process` takes `&mut self` and the
//! last-seen map needs no lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

use super::config::{ProviderPolicy, TuningConfig};
use super::heuristic::{LastSeen, ResetContext, ResetReason};
use super::store::CycleStore;
use super::types::{
    Cycle, CycleClose, NewCycle, ProviderKind, QuotaKey, QuotaReading, SnapshotPoint,
};

/// Callback invoked once per detected reset, after the store write
pub type ResetObserver = Box<dyn Fn(&ResetEvent) + Send + Sync>;

/// A reset transition that has been persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetEvent {
    pub key: QuotaKey,
    pub reason: ResetReason,
    /// End time written to the closed cycle
    pub closed_at: DateTime<Utc>,
    pub closed_peak: f64,
    pub closed_delta: f64,
    pub new_cycle_id: i64,
    pub new_expected_reset: Option<DateTime<Utc>>,
}

/// Effect of processing one reading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrackOutcome {
    /// No active cycle existed; one was opened
    Created { cycle_id: i64 },
    /// The active cycle absorbed the reading
    Updated {
        peak_value: f64,
        cumulative_delta: f64,
    },
    /// The active cycle was closed and a new one opened
    Reset(ResetEvent),
}

/// Per-provider reset-cycle tracker
pub struct QuotaTracker {
    provider: ProviderKind,
    policy: ProviderPolicy,
    store: Arc<dyn CycleStore>,
    last_seen: HashMap<String, LastSeen>,
    observers: Vec<ResetObserver>,
}

impl QuotaTracker {
    pub fn new(provider: ProviderKind, store: Arc<dyn CycleStore>, policy: ProviderPolicy) -> Self {
        Self {
            provider,
            policy,
            store,
            last_seen: HashMap::new(),
            observers: Vec::new(),
        }
    }

    /// Tracker using the provider's policy from a tuning config
    pub fn from_config(
        provider: ProviderKind,
        store: Arc<dyn CycleStore>,
        config: &TuningConfig,
    ) -> Self {
        Self::new(provider, store, config.policy(provider))
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn policy(&self) -> &ProviderPolicy {
        &self.policy
    }

    /// Register a reset observer
    pub fn on_reset(&mut self, observer: impl Fn(&ResetEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn last_seen(&self, quota: &str) -> Option<&LastSeen> {
        self.last_seen.get(quota)
    }

    /// Seed the last-seen state of a quota from its latest stored snapshot
    ///
    /// Lets a short-lived tracker accumulate the step from the previous
    /// reading instead of treating every reading as the first after restart.
    pub fn prime(&mut self, quota: &str, point: &SnapshotPoint) {
        self.last_seen
            .insert(quota.to_string(), LastSeen::from(point));
    }

    /// Drop in-memory state for one quota
    pub fn forget(&mut self, quota: &str) {
        self.last_seen.remove(quota);
    }

    /// Drop all in-memory state, as after a restart
    pub fn clear_last_seen(&mut self) {
        self.last_seen.clear();
    }

    /// Process one reading
    ///
    /// A returned error means the reading's effect is unknown; the caller
    /// should move on to the next poll rather than retry it.
    pub async fn process(&mut self, reading: &QuotaReading) -> Result<TrackOutcome> {
        if reading.key.provider != self.provider {
            return Err(Error::validation(format!(
                "{} reading sent to {} tracker",
                reading.key, self.provider
            )));
        }

        let reading = reading.truncated();
        let key = &reading.key;

        let cycle = self
            .store
            .query_active_cycle(key)
            .await
            .map_err(|e| e.in_quota(key, "query active cycle"))?;

        let outcome = match cycle {
            None => self.open_first_cycle(&reading).await?,
            Some(cycle) => {
                let last = self.last_seen.get(&key.quota);
                let heuristic = self.policy.heuristic_for(&key.quota);
                let step = last
                    .map(|l| (reading.value - l.value).max(0.0))
                    .unwrap_or(0.0);

                match heuristic.evaluate(&ResetContext::new(&cycle, &reading, last)) {
                    Some(reason) => self.roll_over(&cycle, &reading, reason, step).await?,
                    None => self.absorb(&cycle, &reading, step).await?,
                }
            }
        };

        let next = LastSeen::advance(self.last_seen.get(&key.quota), &reading);
        self.last_seen.insert(key.quota.clone(), next);

        if let TrackOutcome::Reset(event) = &outcome {
            for observer in &self.observers {
                observer(event);
            }
        }

        Ok(outcome)
    }

    async fn open_first_cycle(&self, reading: &QuotaReading) -> Result<TrackOutcome> {
        let key = &reading.key;
        let cycle_id = self
            .store
            .create_cycle(key, reading.captured_at, reading.expected_reset, reading.value)
            .await
            .map_err(|e| e.in_quota(key, "create cycle"))?;

        log::info!(
            "[quota:tracker] Created new cycle {} for {} (value {}, expected reset {:?})",
            cycle_id,
            key,
            reading.value,
            reading.expected_reset
        );

        Ok(TrackOutcome::Created { cycle_id })
    }

    async fn roll_over(
        &self,
        cycle: &Cycle,
        reading: &QuotaReading,
        reason: ResetReason,
        step: f64,
    ) -> Result<TrackOutcome> {
        let key = &reading.key;
        let close = CycleClose {
            end: close_time(cycle, reading.captured_at),
            peak_value: cycle.peak_value.max(reading.value),
            cumulative_delta: cycle.cumulative_delta + step,
        };
        let next = NewCycle::active(reading.captured_at, reading.expected_reset, reading.value);

        let new_cycle_id = self
            .store
            .roll_over_cycle(key, close, &next)
            .await
            .map_err(|e| e.in_quota(key, "roll over cycle"))?;

        log::info!(
            "[quota:tracker] Reset detected for {} ({}): expected reset {:?} -> {:?}, closed at {}, delta {:.2}, peak {:.2}",
            key,
            reason,
            cycle.expected_reset,
            reading.expected_reset,
            close.end,
            close.cumulative_delta,
            close.peak_value
        );

        Ok(TrackOutcome::Reset(ResetEvent {
            key: key.clone(),
            reason,
            closed_at: close.end,
            closed_peak: close.peak_value,
            closed_delta: close.cumulative_delta,
            new_cycle_id,
            new_expected_reset: reading.expected_reset,
        }))
    }

    async fn absorb(&self, cycle: &Cycle, reading: &QuotaReading, step: f64) -> Result<TrackOutcome> {
        let key = &reading.key;
        let peak_value = cycle.peak_value.max(reading.value);
        let cumulative_delta = cycle.cumulative_delta + step;

        let follow_reset = self.policy.follows_expected_reset(&key.quota)
            && reading.expected_reset.is_some()
            && reading.expected_reset != cycle.expected_reset;

        if follow_reset {
            self.store
                .update_cycle_with_reset(key, peak_value, cumulative_delta, reading.expected_reset)
                .await
                .map_err(|e| e.in_quota(key, "update cycle"))?;
        } else if step > 0.0 || peak_value > cycle.peak_value {
            self.store
                .update_cycle(key, peak_value, cumulative_delta)
                .await
                .map_err(|e| e.in_quota(key, "update cycle"))?;
        }

        log::debug!(
            "[quota:tracker] {} value {} (+{:.2}), peak {:.2}, delta {:.2}",
            key,
            reading.value,
            step,
            peak_value,
            cumulative_delta
        );

        Ok(TrackOutcome::Updated {
            peak_value,
            cumulative_delta,
        })
    }
}

/// When the closed cycle ended
///
/// A stored expected reset that has already passed is a better estimate than
/// the poll time. Never earlier than the cycle's own start.
pub fn close_time(cycle: &Cycle, captured_at: DateTime<Utc>) -> DateTime<Utc> {
    let end = match cycle.expected_reset {
        Some(reset) if reset <= captured_at => reset,
        _ => captured_at,
    };
    end.max(cycle.cycle_start)
}

// ============================================================================
// Tests
// ============================================================================
