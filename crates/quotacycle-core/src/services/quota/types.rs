//! Quota tracking types
//!
//! Shared data model for readings, cycles and snapshot history.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Provider Types
// ============================================================================

/// Provider a quota belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Synthetic (subscription / search / tool-call request counters)
    Synthetic,
    /// Z.ai (token budget with explicit next reset, elapsed-time budget)
    Zai,
    /// Anthropic (5-hour and 7-day utilization windows)
    Anthropic,
    /// Codex (utilization windows with rolling reset timestamps)
    Codex,
    /// GitHub Copilot (monthly entitlements)
    Copilot,
    /// Antigravity (per-model remaining fractions)
    Antigravity,
    /// MiniMax (per-model request windows)
    #[serde(rename = "minimax")]
    MiniMax,
}

impl ProviderKind {
    /// Every supported provider, in display order
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::Synthetic,
        ProviderKind::Zai,
        ProviderKind::Anthropic,
        ProviderKind::Codex,
        ProviderKind::Copilot,
        ProviderKind::Antigravity,
        ProviderKind::MiniMax,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Synthetic => "synthetic",
            ProviderKind::Zai => "zai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Codex => "codex",
            ProviderKind::Copilot => "copilot",
            ProviderKind::Antigravity => "antigravity",
            ProviderKind::MiniMax => "minimax",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synthetic" => Ok(ProviderKind::Synthetic),
            "zai" | "z.ai" => Ok(ProviderKind::Zai),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "codex" | "openai" => Ok(ProviderKind::Codex),
            "copilot" | "github_copilot" => Ok(ProviderKind::Copilot),
            "antigravity" | "gemini" => Ok(ProviderKind::Antigravity),
            "minimax" => Ok(ProviderKind::MiniMax),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

/// Identity of one periodically-resetting counter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaKey {
    pub provider: ProviderKind,
    pub quota: String,
}

impl QuotaKey {
    pub fn new(provider: ProviderKind, quota: impl Into<String>) -> Self {
        Self {
            provider,
            quota: quota.into(),
        }
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.quota)
    }
}

// ============================================================================
// Units
// ============================================================================

/// Numeric unit of a provider's usage values
///
/// All values reaching the tracker are "usage goes up" values; fractional
/// remaining readings are converted by [`QuotaReading::from_remaining_fraction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueUnit {
    /// Utilization percentage (0-100)
    Percent,
    /// Absolute count (requests, tokens, seconds)
    Count,
    /// Used fraction (0.0-1.0)
    Fraction,
}

impl ValueUnit {
    /// Upper bound for projections, if the unit has one
    pub fn ceiling(&self) -> Option<f64> {
        match self {
            ValueUnit::Percent => Some(100.0),
            ValueUnit::Count => None,
            ValueUnit::Fraction => Some(1.0),
        }
    }

    /// Whether `current` dropped from `last` by more than `fraction` of scale
    ///
    /// Bounded units compare in absolute points of their scale; counts have no
    /// scale, so the drop is taken relative to the previous value.
    pub fn is_material_drop(&self, last: f64, current: f64, fraction: f64) -> bool {
        match self.ceiling() {
            Some(ceiling) => {
                let margin = ceiling * fraction;
                last > margin && current < last - margin
            }
            None => last > 0.0 && current < last * (1.0 - fraction),
        }
    }
}

// ============================================================================
// Readings
// ============================================================================

/// Window identity reported alongside a reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// One usage reading for one quota, as produced by a poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaReading {
    pub key: QuotaKey,
    /// Observed usage value
    pub value: f64,
    /// When the reading was taken
    pub captured_at: DateTime<Utc>,
    /// Provider's claimed next reset
    pub expected_reset: Option<DateTime<Utc>>,
    /// Provider's claimed window bounds
    pub window: Option<WindowBounds>,
}

impl QuotaReading {
    pub fn new(key: QuotaKey, value: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            captured_at,
            expected_reset: None,
            window: None,
        }
    }

    /// Build a reading from a remaining fraction (1.0 = untouched quota)
    pub fn from_remaining_fraction(
        key: QuotaKey,
        remaining: f64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self::new(key, (1.0 - remaining).clamp(0.0, 1.0), captured_at)
    }

    /// Set the expected reset time
    pub fn with_expected_reset(mut self, expected_reset: DateTime<Utc>) -> Self {
        self.expected_reset = Some(expected_reset);
        self
    }

    /// Set the expected reset time from an optional value
    pub fn with_optional_reset(mut self, expected_reset: Option<DateTime<Utc>>) -> Self {
        self.expected_reset = expected_reset;
        self
    }

    /// Set the reported window bounds
    pub fn with_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.window = Some(WindowBounds { start, end });
        self
    }

    /// Copy truncated to the millisecond precision the store keeps
    pub fn truncated(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value,
            captured_at: self.captured_at.trunc_subsecs(3),
            expected_reset: self.expected_reset.map(|t| t.trunc_subsecs(3)),
            window: self.window.map(|w| WindowBounds {
                start: w.start.map(|t| t.trunc_subsecs(3)),
                end: w.end.map(|t| t.trunc_subsecs(3)),
            }),
        }
    }
}

// ============================================================================
// Cycles
// ============================================================================

/// One reset-to-reset window for a quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: i64,
    pub key: QuotaKey,
    pub cycle_start: DateTime<Utc>,
    /// Absent while the cycle is active
    pub cycle_end: Option<DateTime<Utc>>,
    pub expected_reset: Option<DateTime<Utc>>,
    pub peak_value: f64,
    pub cumulative_delta: f64,
}

impl Cycle {
    pub fn is_active(&self) -> bool {
        self.cycle_end.is_none()
    }

    /// Length of a closed cycle
    pub fn duration(&self) -> Option<Duration> {
        self.cycle_end.map(|end| end - self.cycle_start)
    }
}

/// Fields for a cycle about to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCycle {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub expected_reset: Option<DateTime<Utc>>,
    pub peak_value: f64,
    pub cumulative_delta: f64,
}

impl NewCycle {
    /// An active cycle seeded with its first value
    pub fn active(start: DateTime<Utc>, expected_reset: Option<DateTime<Utc>>, peak: f64) -> Self {
        Self {
            start,
            end: None,
            expected_reset,
            peak_value: peak,
            cumulative_delta: 0.0,
        }
    }
}

/// Final accounting written when a cycle closes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleClose {
    pub end: DateTime<Utc>,
    pub peak_value: f64,
    pub cumulative_delta: f64,
}

/// One merged cycle and the cycles that replace it
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReplacement {
    pub bad_cycle_id: i64,
    pub replacements: Vec<NewCycle>,
}

// ============================================================================
// Snapshot history
// ============================================================================

/// One raw, immutable historical reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPoint {
    pub captured_at: DateTime<Utc>,
    pub value: f64,
    pub expected_reset: Option<DateTime<Utc>>,
}

impl From<&QuotaReading> for SnapshotPoint {
    fn from(reading: &QuotaReading) -> Self {
        Self {
            captured_at: reading.captured_at,
            value: reading.value,
            expected_reset: reading.expected_reset,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
