//! Quota polling loop
//!
//! Drives one provider: fetch readings from a [`SnapshotSource`], append them
//! to snapshot history, then feed them to the provider's [`QuotaTracker`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QuotaPoller                          │
//! │                                                             │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐  │
//! │  │ Config       │    │ Timer Loop   │    │ Status       │  │
//! │  │ - interval   │    │ - poll_once()│    │ - last_poll  │  │
//! │  │ - enabled    │    │ - tick()     │    │ - resets     │  │
//! │  └──────────────┘    └──────────────┘    └──────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!           │                    │                    │
//!           ▼                    ▼                    ▼
//!    ┌──────────┐         ┌────────────┐       ┌──────────┐
//!    │ Snapshot │         │QuotaTracker│       │CycleStore│
//!    │ Source   │         │ (1 owner)  │       │ (SQLite) │
//!    └──────────┘         └────────────┘       └──────────┘
//! ```
//!
//! Readings within one poll are processed strictly in order. A failing
//! reading is logged and reported; it is not retried, and the remaining
//! readings are still processed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::{Error, Result};

use super::store::CycleStore;
use super::tracker::{QuotaTracker, ResetEvent, TrackOutcome};
use super::types::{ProviderKind, QuotaReading};

// ============================================================================
// Constants
// ============================================================================

/// Minimum polling interval in minutes
pub const MIN_INTERVAL_MINUTES: u32 = 1;

/// Default polling interval in minutes
pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for quota polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaPollingConfig {
    /// Whether polling is enabled
    pub enabled: bool,
    /// Polling interval in minutes (minimum 1)
    pub interval_minutes: u32,
}

impl Default for QuotaPollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
        }
    }
}

impl QuotaPollingConfig {
    /// Create a new configuration with the specified interval
    pub fn with_interval(interval_minutes: u32) -> Self {
        Self {
            interval_minutes: interval_minutes.max(MIN_INTERVAL_MINUTES),
            ..Default::default()
        }
    }

    /// Validate and normalize the configuration
    pub fn validate(&self) -> Self {
        Self {
            enabled: self.enabled,
            interval_minutes: self.interval_minutes.max(MIN_INTERVAL_MINUTES),
        }
    }

    /// Get the polling interval
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }
}

// ============================================================================
// Snapshot Source
// ============================================================================

/// Producer of readings for one provider
///
/// Implementations wrap a provider's HTTP client and map its payload to
/// [`QuotaReading`]s; fractional-remaining payloads should go through
/// [`QuotaReading::from_remaining_fraction`].
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Fetch the current reading of every quota
    async fn fetch(&self) -> Result<Vec<QuotaReading>>;
}

// ============================================================================
// Status
// ============================================================================

/// Status of a polling loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaPollingStatus {
    /// Whether the loop is currently running
    pub is_running: bool,
    /// Whether a poll is currently in progress
    pub is_polling: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Last error message (if any)
    pub last_error: Option<String>,
    pub polls: u64,
    /// Resets detected since start
    pub reset_count: u64,
}

/// Shared status wrapper for thread-safe access
pub type SharedPollingStatus = Arc<RwLock<QuotaPollingStatus>>;

/// Result of one poll
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub readings: usize,
    pub created: usize,
    pub updated: usize,
    pub resets: Vec<ResetEvent>,
    /// One message per failed fetch, snapshot write or reading
    pub errors: Vec<String>,
}

impl PollReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Poll loop for one provider
pub struct QuotaPoller {
    source: Box<dyn SnapshotSource>,
    tracker: QuotaTracker,
    store: Arc<dyn CycleStore>,
    config: QuotaPollingConfig,
    status: SharedPollingStatus,
}

impl QuotaPoller {
    pub fn new(
        source: Box<dyn SnapshotSource>,
        tracker: QuotaTracker,
        store: Arc<dyn CycleStore>,
        config: QuotaPollingConfig,
    ) -> Result<Self> {
        if source.provider() != tracker.provider() {
            return Err(Error::validation(format!(
                "{} source paired with {} tracker",
                source.provider(),
                tracker.provider()
            )));
        }

        Ok(Self {
            source,
            tracker,
            store,
            config: config.validate(),
            status: Arc::new(RwLock::new(QuotaPollingStatus::default())),
        })
    }

    pub fn status(&self) -> SharedPollingStatus {
        Arc::clone(&self.status)
    }

    /// Tracker access for registering reset observers
    pub fn tracker_mut(&mut self) -> &mut QuotaTracker {
        &mut self.tracker
    }

    /// Fetch, record and process one round of readings
    pub async fn poll_once(&mut self) -> PollReport {
        let provider = self.source.provider();
        let mut report = PollReport::default();
        self.status.write().await.is_polling = true;

        match self.source.fetch().await {
            Ok(readings) => {
                report.readings = readings.len();
                for reading in &readings {
                    self.handle_reading(reading, &mut report).await;
                }
            }
            Err(e) => {
                log::warn!("[quota:timer] Fetch failed for {}: {}", provider, e);
                report.errors.push(format!("fetch: {}", e));
            }
        }

        let mut status = self.status.write().await;
        status.is_polling = false;
        status.polls += 1;
        status.last_poll_at = Some(Utc::now());
        status.last_error = report.errors.last().cloned();
        status.reset_count += report.resets.len() as u64;

        log::debug!(
            "[quota:timer] Polled {}: {} readings, {} resets, {} errors",
            provider,
            report.readings,
            report.resets.len(),
            report.errors.len()
        );

        report
    }

    async fn handle_reading(&mut self, reading: &QuotaReading, report: &mut PollReport) {
        if let Err(e) = self.store.insert_snapshot(&reading.truncated()).await {
            let e = e.in_quota(&reading.key, "insert snapshot");
            log::warn!("[quota:timer] {}", e);
            report.errors.push(e.to_string());
        }

        match self.tracker.process(reading).await {
            Ok(TrackOutcome::Created { .. }) => report.created += 1,
            Ok(TrackOutcome::Updated { .. }) => report.updated += 1,
            Ok(TrackOutcome::Reset(event)) => report.resets.push(event),
            Err(e) => {
                log::error!("[quota:timer] Failed to process reading: {}", e);
                report.errors.push(e.to_string());
            }
        }
    }

    /// Poll on the configured interval until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let provider = self.source.provider();
        if !self.config.enabled {
            log::info!("[quota:timer] Polling disabled for {}", provider);
            return;
        }

        log::info!(
            "[quota:timer] Starting poll loop for {} every {} min",
            provider,
            self.config.interval_minutes
        );
        self.status.write().await.is_running = true;

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.status.write().await.is_running = false;
        log::info!("[quota:timer] Poll loop for {} stopped", provider);
    }
}

// ============================================================================
// Tests
// ============================================================================
