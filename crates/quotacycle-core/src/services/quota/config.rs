//! Provider tuning configuration
//!
//! Per-provider reset heuristics and repair thresholds are data, not code.
//! [`TuningConfig::default`] carries the observed tuning for every provider;
//! a JSON file can override individual providers.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::heuristic::{ResetHeuristic, ResetReference, ResetSignal};
use super::types::{ProviderKind, ValueUnit};

// ============================================================================
// Quota Rules
// ============================================================================

/// Which quota keys a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMatcher {
    Exact(String),
    Prefix(String),
    Any,
}

impl QuotaMatcher {
    pub fn matches(&self, quota: &str) -> bool {
        match self {
            QuotaMatcher::Exact(name) => quota == name,
            QuotaMatcher::Prefix(prefix) => quota.starts_with(prefix.as_str()),
            QuotaMatcher::Any => true,
        }
    }
}

/// Reset signals and repair threshold for a family of quota keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub matcher: QuotaMatcher,
    pub signals: Vec<ResetSignal>,
    /// Closed cycles longer than this are repair candidates
    #[serde(default)]
    pub max_cycle_hours: Option<u32>,
    /// Keep the active cycle's expected reset in step with readings
    #[serde(default)]
    pub follow_expected_reset: bool,
}

impl QuotaRule {
    fn new(matcher: QuotaMatcher, signals: Vec<ResetSignal>, max_cycle_hours: Option<u32>) -> Self {
        Self {
            matcher,
            signals,
            max_cycle_hours,
            follow_expected_reset: false,
        }
    }

    fn following(mut self) -> Self {
        self.follow_expected_reset = true;
        self
    }
}

// ============================================================================
// Provider Policy
// ============================================================================

/// Everything provider-specific the tracker and repair engine need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub unit: ValueUnit,
    /// Evaluated in order; the first matching rule wins
    pub rules: Vec<QuotaRule>,
    /// Repair boundary rules for this provider; the global set when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundaries: Option<BoundaryRules>,
}

impl ProviderPolicy {
    /// First rule matching the quota key
    pub fn rule_for(&self, quota: &str) -> Option<&QuotaRule> {
        self.rules.iter().find(|rule| rule.matcher.matches(quota))
    }

    /// Reset heuristic for one quota key (never fires if no rule matches)
    pub fn heuristic_for(&self, quota: &str) -> ResetHeuristic {
        ResetHeuristic::new(
            self.rule_for(quota)
                .map(|rule| rule.signals.clone())
                .unwrap_or_default(),
        )
    }

    /// Longest plausible cycle for one quota key, if repair applies
    pub fn max_cycle_duration(&self, quota: &str) -> Option<Duration> {
        self.rule_for(quota)
            .and_then(|rule| rule.max_cycle_hours)
            .map(|hours| Duration::hours(i64::from(hours)))
    }

    pub fn follows_expected_reset(&self, quota: &str) -> bool {
        self.rule_for(quota)
            .is_some_and(|rule| rule.follow_expected_reset)
    }

    /// Observed tuning for a provider
    pub fn default_for(provider: ProviderKind) -> Self {
        use QuotaMatcher::{Any, Exact, Prefix};

        let expiry = ResetSignal::TimeExpiry { grace_minutes: 2 };
        let exact_jump = ResetSignal::ExpectedResetJump {
            tolerance_minutes: 0,
            reference: ResetReference::Cycle,
        };

        match provider {
            ProviderKind::Anthropic => {
                let signals = vec![
                    expiry,
                    ResetSignal::ExpectedResetJump {
                        tolerance_minutes: 10,
                        reference: ResetReference::LastSeen,
                    },
                    ResetSignal::ExpectedResetAppeared,
                ];
                Self {
                    unit: ValueUnit::Percent,
                    rules: vec![
                        QuotaRule::new(Exact("five_hour".into()), signals.clone(), Some(6)),
                        QuotaRule::new(Prefix("seven_day".into()), signals.clone(), Some(8 * 24)),
                        QuotaRule::new(Exact("monthly_limit".into()), signals.clone(), Some(32 * 24)),
                        QuotaRule::new(Any, signals, Some(6)),
                    ],
                    boundaries: None,
                }
            }
            ProviderKind::Codex => {
                let signals = vec![
                    expiry,
                    ResetSignal::ExpectedResetJumpWithDrop {
                        tolerance_minutes: 60,
                        min_drop: 2.0,
                    },
                    ResetSignal::TimeGapDrop { gap_minutes: 60 },
                ];
                Self {
                    unit: ValueUnit::Percent,
                    rules: vec![
                        QuotaRule::new(Exact("five_hour".into()), signals.clone(), Some(6)).following(),
                        QuotaRule::new(Prefix("seven_day".into()), signals.clone(), Some(8 * 24))
                            .following(),
                        QuotaRule::new(Any, signals, None).following(),
                    ],
                    // Rolling reset timestamps: a shift alone is not a reset
                    boundaries: Some(BoundaryRules {
                        jitter_minutes: 60,
                        shift_requires_drop: true,
                        ..BoundaryRules::default()
                    }),
                }
            }
            ProviderKind::Synthetic => {
                let signals = vec![
                    expiry,
                    ResetSignal::ExpectedResetHourChanged {
                        reference: ResetReference::Cycle,
                    },
                ];
                Self {
                    unit: ValueUnit::Count,
                    rules: vec![
                        QuotaRule::new(Exact("search".into()), signals.clone(), Some(2)),
                        QuotaRule::new(Exact("subscription".into()), signals.clone(), Some(48)),
                        QuotaRule::new(Any, signals, None),
                    ],
                    boundaries: None,
                }
            }
            ProviderKind::Zai => {
                let tokens = vec![expiry, exact_jump, ResetSignal::ExpectedResetAppeared];
                Self {
                    unit: ValueUnit::Count,
                    rules: vec![
                        QuotaRule::new(Exact("tokens".into()), tokens.clone(), Some(48)),
                        QuotaRule::new(
                            Exact("time".into()),
                            vec![ResetSignal::ValueDrop {
                                ratio: 0.5,
                                floor: 0.0,
                            }],
                            None,
                        ),
                        QuotaRule::new(Any, tokens, None),
                    ],
                    boundaries: None,
                }
            }
            ProviderKind::Copilot => Self {
                unit: ValueUnit::Count,
                rules: vec![QuotaRule::new(
                    Any,
                    vec![expiry, exact_jump, ResetSignal::ExpectedResetAppeared],
                    Some(32 * 24),
                )],
                boundaries: None,
            },
            ProviderKind::Antigravity => Self {
                unit: ValueUnit::Fraction,
                rules: vec![QuotaRule::new(
                    Any,
                    vec![
                        ResetSignal::ExpectedResetJump {
                            tolerance_minutes: 10,
                            reference: ResetReference::LastSeen,
                        },
                        ResetSignal::AbsoluteDrop { margin: 0.1 },
                        ResetSignal::TimeExpiryWithDrop { grace_minutes: 0 },
                    ],
                    Some(6),
                )],
                boundaries: None,
            },
            ProviderKind::MiniMax => Self {
                unit: ValueUnit::Count,
                rules: vec![QuotaRule::new(
                    Any,
                    vec![
                        ResetSignal::ExpectedResetJump {
                            tolerance_minutes: 0,
                            reference: ResetReference::LastSeen,
                        },
                        ResetSignal::WindowChanged,
                        ResetSignal::ValueDrop {
                            ratio: 0.5,
                            floor: 0.0,
                        },
                    ],
                    Some(6),
                )],
                boundaries: None,
            },
        }
    }
}

// ============================================================================
// Repair Boundaries
// ============================================================================

/// Constants used to find reset boundaries in snapshot history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryRules {
    /// Expected-reset shifts at or below this are jitter
    pub jitter_minutes: i64,
    /// Poll gaps longer than this count when combined with a drop
    pub gap_minutes: i64,
    /// Drop size, as a fraction of the unit's scale, that marks a reset
    pub material_drop: f64,
    /// Expected-reset evidence only counts alongside a value decrease
    #[serde(default)]
    pub shift_requires_drop: bool,
}

impl Default for BoundaryRules {
    fn default() -> Self {
        Self {
            jitter_minutes: 10,
            gap_minutes: 60,
            material_drop: 0.2,
            shift_requires_drop: false,
        }
    }
}

impl BoundaryRules {
    fn validate(&self, scope: &str) -> Result<()> {
        if self.jitter_minutes < 0 {
            return Err(Error::config(format!("{}: jitter_minutes must not be negative", scope)));
        }
        if self.gap_minutes <= 0 {
            return Err(Error::config(format!("{}: gap_minutes must be positive", scope)));
        }
        if !(self.material_drop > 0.0 && self.material_drop <= 1.0) {
            return Err(Error::config(format!("{}: material_drop must be in (0, 1]", scope)));
        }
        Ok(())
    }
}

// ============================================================================
// Tuning Config
// ============================================================================

/// Full tuning for all providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    pub providers: BTreeMap<ProviderKind, ProviderPolicy>,
    pub boundaries: BoundaryRules,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            providers: ProviderKind::ALL
                .iter()
                .map(|p| (*p, ProviderPolicy::default_for(*p)))
                .collect(),
            boundaries: BoundaryRules::default(),
        }
    }
}

/// On-disk shape: every section optional
#[derive(Debug, Default, Deserialize)]
struct TuningFile {
    #[serde(default)]
    providers: BTreeMap<ProviderKind, ProviderPolicy>,
    #[serde(default)]
    boundaries: Option<BoundaryRules>,
}

impl TuningConfig {
    /// Load overrides from a JSON file on top of the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        log::info!(
            "[quota:config] Loaded tuning overrides from {}",
            path.display()
        );
        Ok(config)
    }

    /// Parse overrides from JSON on top of the defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let file: TuningFile = serde_json::from_str(json)?;
        let mut config = Self::default();
        for (provider, policy) in file.providers {
            config.providers.insert(provider, policy);
        }
        if let Some(boundaries) = file.boundaries {
            config.boundaries = boundaries;
        }
        config.validate()?;
        Ok(config)
    }

    /// Policy for a provider, falling back to the built-in tuning
    pub fn policy(&self, provider: ProviderKind) -> ProviderPolicy {
        self.providers
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| ProviderPolicy::default_for(provider))
    }

    /// Repair boundary rules for a provider
    pub fn boundaries_for(&self, provider: ProviderKind) -> BoundaryRules {
        self.policy(provider)
            .boundaries
            .unwrap_or_else(|| self.boundaries.clone())
    }

    /// Reject settings that would make detection meaningless
    pub fn validate(&self) -> Result<()> {
        for (provider, policy) in &self.providers {
            for rule in &policy.rules {
                if rule.max_cycle_hours == Some(0) {
                    return Err(Error::config(format!(
                        "{}: max_cycle_hours must be positive",
                        provider
                    )));
                }
                for signal in &rule.signals {
                    validate_signal(signal)
                        .map_err(|msg| Error::config(format!("{}: {}", provider, msg)))?;
                }
            }
            if let Some(boundaries) = &policy.boundaries {
                boundaries.validate(&format!("{} boundaries", provider))?;
            }
        }

        self.boundaries.validate("boundaries")
    }
}

fn validate_signal(signal: &ResetSignal) -> std::result::Result<(), String> {
    match *signal {
        ResetSignal::TimeExpiry { grace_minutes }
        | ResetSignal::TimeExpiryWithDrop { grace_minutes } => {
            if grace_minutes < 0 {
                return Err("grace_minutes must not be negative".into());
            }
        }
        ResetSignal::ExpectedResetJump {
            tolerance_minutes, ..
        } => {
            if tolerance_minutes < 0 {
                return Err("tolerance_minutes must not be negative".into());
            }
        }
        ResetSignal::ExpectedResetJumpWithDrop {
            tolerance_minutes,
            min_drop,
        } => {
            if tolerance_minutes < 0 || min_drop < 0.0 {
                return Err("tolerance_minutes and min_drop must not be negative".into());
            }
        }
        ResetSignal::ValueDrop { ratio, floor } => {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err("value_drop ratio must be in (0, 1]".into());
            }
            if floor < 0.0 {
                return Err("value_drop floor must not be negative".into());
            }
        }
        ResetSignal::AbsoluteDrop { margin } => {
            if margin <= 0.0 {
                return Err("absolute_drop margin must be positive".into());
            }
        }
        ResetSignal::TimeGapDrop { gap_minutes } => {
            if gap_minutes <= 0 {
                return Err("gap_minutes must be positive".into());
            }
        }
        ResetSignal::ExpectedResetHourChanged { .. }
        | ResetSignal::ExpectedResetAppeared
        | ResetSignal::ExpectedResetDisappeared
        | ResetSignal::WindowChanged => {}
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
