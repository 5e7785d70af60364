//! Reset detection
//!
//! A provider's reset heuristic is an ordered list of [`ResetSignal`]s
//! combined with OR. Signals are evaluated cheapest-first and the first one
//! that fires names the [`ResetReason`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Cycle, QuotaReading, SnapshotPoint, WindowBounds};

// ============================================================================
// Tracker State
// ============================================================================

/// In-memory state from the previous reading of one quota
#[derive(Debug, Clone, PartialEq)]
pub struct LastSeen {
    pub value: f64,
    /// Last expected reset any reading reported, kept across polls that omit it
    pub expected_reset: Option<DateTime<Utc>>,
    /// Whether the previous reading itself carried an expected reset
    pub reset_reported: bool,
    pub window: Option<WindowBounds>,
    pub captured_at: DateTime<Utc>,
}

impl LastSeen {
    /// State after `reading`, carrying the previous expected reset forward
    /// when the reading omits one
    pub fn advance(previous: Option<&LastSeen>, reading: &QuotaReading) -> Self {
        let mut next = Self::from(reading);
        if next.expected_reset.is_none() {
            next.expected_reset = previous.and_then(|p| p.expected_reset);
        }
        next
    }
}

impl From<&QuotaReading> for LastSeen {
    fn from(reading: &QuotaReading) -> Self {
        Self {
            value: reading.value,
            expected_reset: reading.expected_reset,
            reset_reported: reading.expected_reset.is_some(),
            window: reading.window,
            captured_at: reading.captured_at,
        }
    }
}

/// Rebuilt from the persisted snapshot history; window bounds are not stored
impl From<&SnapshotPoint> for LastSeen {
    fn from(point: &SnapshotPoint) -> Self {
        Self {
            value: point.value,
            expected_reset: point.expected_reset,
            reset_reported: point.expected_reset.is_some(),
            window: None,
            captured_at: point.captured_at,
        }
    }
}

/// Everything a signal may look at
#[derive(Debug, Clone, Copy)]
pub struct ResetContext<'a> {
    /// The stored active cycle
    pub cycle: &'a Cycle,
    /// The reading being processed
    pub reading: &'a QuotaReading,
    /// Previous reading, absent right after a restart
    pub last_seen: Option<&'a LastSeen>,
}

impl<'a> ResetContext<'a> {
    pub fn new(cycle: &'a Cycle, reading: &'a QuotaReading, last_seen: Option<&'a LastSeen>) -> Self {
        Self {
            cycle,
            reading,
            last_seen,
        }
    }

    /// Expected reset the reading is compared against
    fn previous_reset(&self, reference: ResetReference) -> Option<DateTime<Utc>> {
        match (reference, self.last_seen) {
            (ResetReference::LastSeen, Some(last)) => last.expected_reset,
            _ => self.cycle.expected_reset,
        }
    }

    fn last_value(&self) -> Option<f64> {
        self.last_seen.map(|l| l.value)
    }

    /// Whether the reading was captured more than `grace` past the stored reset
    fn past_stored_reset(&self, grace: Duration) -> Option<DateTime<Utc>> {
        let stored = self.cycle.expected_reset?;
        (self.reading.captured_at > stored + grace).then_some(stored)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Which earlier expected reset a comparison uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReference {
    /// The last value any reading reported; the stored cycle's right after a restart
    LastSeen,
    /// The value stored on the active cycle
    Cycle,
}

/// One reset-detection building block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResetSignal {
    /// Captured more than `grace_minutes` past the stored expected reset
    TimeExpiry { grace_minutes: i64 },
    /// Expected reset moved by more than `tolerance_minutes` (0 = any change)
    ExpectedResetJump {
        tolerance_minutes: i64,
        reference: ResetReference,
    },
    /// Expected reset moved to a different clock hour
    ExpectedResetHourChanged { reference: ResetReference },
    /// Expected reset moved by more than `tolerance_minutes` and usage dropped
    /// by more than `min_drop`
    ExpectedResetJumpWithDrop { tolerance_minutes: i64, min_drop: f64 },
    /// The active cycle has no expected reset and the reading reports one
    ExpectedResetAppeared,
    /// The active cycle has an expected reset and two consecutive readings
    /// omitted it
    ExpectedResetDisappeared,
    /// Usage fell below `ratio` of the previous value, which was above `floor`
    ValueDrop { ratio: f64, floor: f64 },
    /// Usage fell by more than `margin`
    AbsoluteDrop { margin: f64 },
    /// Past the stored expected reset and usage decreased
    TimeExpiryWithDrop { grace_minutes: i64 },
    /// Reported window bounds differ from the previous reading's
    WindowChanged,
    /// More than `gap_minutes` since the previous reading and usage decreased
    TimeGapDrop { gap_minutes: i64 },
}

/// Why a reset was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    TimeExpiry,
    ExpectedResetJump,
    ExpectedResetHourChanged,
    ExpectedResetJumpWithDrop,
    ExpectedResetAppeared,
    ExpectedResetDisappeared,
    ValueDrop,
    AbsoluteDrop,
    TimeExpiryWithDrop,
    WindowChanged,
    TimeGapDrop,
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResetReason::TimeExpiry => "time_expiry",
            ResetReason::ExpectedResetJump => "expected_reset_jump",
            ResetReason::ExpectedResetHourChanged => "expected_reset_hour_changed",
            ResetReason::ExpectedResetJumpWithDrop => "expected_reset_jump_with_drop",
            ResetReason::ExpectedResetAppeared => "expected_reset_appeared",
            ResetReason::ExpectedResetDisappeared => "expected_reset_disappeared",
            ResetReason::ValueDrop => "value_drop",
            ResetReason::AbsoluteDrop => "absolute_drop",
            ResetReason::TimeExpiryWithDrop => "time_expiry_with_drop",
            ResetReason::WindowChanged => "window_changed",
            ResetReason::TimeGapDrop => "time_gap_drop",
        };
        f.write_str(s)
    }
}

fn hour_index(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(3600)
}

fn shifted_beyond(a: DateTime<Utc>, b: DateTime<Utc>, tolerance_minutes: i64) -> bool {
    if tolerance_minutes == 0 {
        return a != b;
    }
    (a - b).abs() > Duration::minutes(tolerance_minutes)
}

impl ResetSignal {
    pub fn reason(&self) -> ResetReason {
        match self {
            ResetSignal::TimeExpiry { .. } => ResetReason::TimeExpiry,
            ResetSignal::ExpectedResetJump { .. } => ResetReason::ExpectedResetJump,
            ResetSignal::ExpectedResetHourChanged { .. } => ResetReason::ExpectedResetHourChanged,
            ResetSignal::ExpectedResetJumpWithDrop { .. } => ResetReason::ExpectedResetJumpWithDrop,
            ResetSignal::ExpectedResetAppeared => ResetReason::ExpectedResetAppeared,
            ResetSignal::ExpectedResetDisappeared => ResetReason::ExpectedResetDisappeared,
            ResetSignal::ValueDrop { .. } => ResetReason::ValueDrop,
            ResetSignal::AbsoluteDrop { .. } => ResetReason::AbsoluteDrop,
            ResetSignal::TimeExpiryWithDrop { .. } => ResetReason::TimeExpiryWithDrop,
            ResetSignal::WindowChanged => ResetReason::WindowChanged,
            ResetSignal::TimeGapDrop { .. } => ResetReason::TimeGapDrop,
        }
    }

    /// Whether this signal fires for the given context
    pub fn fires(&self, ctx: &ResetContext<'_>) -> bool {
        let reading = ctx.reading;
        match *self {
            ResetSignal::TimeExpiry { grace_minutes } => {
                let grace = Duration::minutes(grace_minutes);
                match ctx.past_stored_reset(grace) {
                    // A reading still quoting the expired reset has not rolled over yet
                    Some(stored) => match reading.expected_reset {
                        Some(current) => current > stored + grace,
                        None => true,
                    },
                    None => false,
                }
            }
            ResetSignal::ExpectedResetJump {
                tolerance_minutes,
                reference,
            } => match (reading.expected_reset, ctx.previous_reset(reference)) {
                (Some(current), Some(previous)) => {
                    shifted_beyond(current, previous, tolerance_minutes)
                }
                _ => false,
            },
            ResetSignal::ExpectedResetHourChanged { reference } => {
                match (reading.expected_reset, ctx.previous_reset(reference)) {
                    (Some(current), Some(previous)) => hour_index(current) != hour_index(previous),
                    _ => false,
                }
            }
            ResetSignal::ExpectedResetJumpWithDrop {
                tolerance_minutes,
                min_drop,
            } => {
                let shifted = match (
                    reading.expected_reset,
                    ctx.previous_reset(ResetReference::LastSeen),
                ) {
                    (Some(current), Some(previous)) => {
                        shifted_beyond(current, previous, tolerance_minutes)
                    }
                    _ => false,
                };
                shifted
                    && ctx
                        .last_value()
                        .is_some_and(|last| reading.value < last - min_drop)
            }
            ResetSignal::ExpectedResetAppeared => {
                reading.expected_reset.is_some() && ctx.cycle.expected_reset.is_none()
            }
            // One poll without the field is a flaky response, not a reset
            ResetSignal::ExpectedResetDisappeared => {
                reading.expected_reset.is_none()
                    && ctx.cycle.expected_reset.is_some()
                    && ctx.last_seen.is_some_and(|l| !l.reset_reported)
            }
            ResetSignal::ValueDrop { ratio, floor } => ctx
                .last_value()
                .is_some_and(|last| last > floor && reading.value < last * ratio),
            ResetSignal::AbsoluteDrop { margin } => ctx
                .last_value()
                .is_some_and(|last| reading.value < last - margin),
            ResetSignal::TimeExpiryWithDrop { grace_minutes } => {
                ctx.past_stored_reset(Duration::minutes(grace_minutes)).is_some()
                    && ctx.last_value().is_some_and(|last| reading.value < last)
            }
            ResetSignal::WindowChanged => {
                match (reading.window, ctx.last_seen.and_then(|l| l.window)) {
                    (Some(current), Some(previous)) => current != previous,
                    _ => false,
                }
            }
            ResetSignal::TimeGapDrop { gap_minutes } => ctx.last_seen.is_some_and(|last| {
                reading.captured_at - last.captured_at > Duration::minutes(gap_minutes)
                    && reading.value < last.value
            }),
        }
    }
}

// ============================================================================
// Heuristic
// ============================================================================

/// Ordered OR-composition of reset signals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResetHeuristic {
    signals: Vec<ResetSignal>,
}

impl ResetHeuristic {
    pub fn new(signals: Vec<ResetSignal>) -> Self {
        Self { signals }
    }

    pub fn signals(&self) -> &[ResetSignal] {
        &self.signals
    }

    /// First signal that fires, if any
    pub fn evaluate(&self, ctx: &ResetContext<'_>) -> Option<ResetReason> {
        self.signals
            .iter()
            .find(|signal| signal.fires(ctx))
            .map(ResetSignal::reason)
    }
}

// ============================================================================
// Tests
// ============================================================================
