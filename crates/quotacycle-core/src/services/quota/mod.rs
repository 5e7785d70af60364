//! Quota reset-cycle tracking
//!
//! Turns noisy, irregularly timestamped usage readings into reset cycles:
//! contiguous windows between resets, each with a peak value and a
//! cumulative usage delta.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────────────────────────┐
//! │ SnapshotSource   │ ───▶ │ QuotaPoller (one per provider)       │
//! │   - fetch()      │      │   - insert_snapshot()                │
//! └──────────────────┘      │   - QuotaTracker::process()          │
//!                           │        └─ ResetHeuristic (policy)    │
//!                           └──────────────────────────────────────┘
//!                                              │
//!                                              ▼
//! ┌──────────────────┐      ┌──────────────────────────────────────┐
//! │ CycleRepairEngine│ ◀──▶ │ trait CycleStore                     │
//! │  (once, startup) │      │   reset_cycles / quota_snapshots /   │
//! └──────────────────┘      │   settings (SqliteCycleStore)        │
//!                           └──────────────────────────────────────┘
//!                                              │
//!                                              ▼
//!                           ┌──────────────────────────────────────┐
//!                           │ UsageSummarizer (read-only)          │
//!                           └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use quotacycle_core::services::quota::{
//!     CycleRepairEngine, ProviderKind, QuotaKey, QuotaReading, QuotaTracker,
//!     SqliteCycleStore, TuningConfig,
//! };
//!
//! let store = Arc::new(SqliteCycleStore::new(db.pool.clone()));
//! let config = TuningConfig::default();
//!
//! CycleRepairEngine::new(store.clone(), config.clone())
//!     .repair_if_needed()
//!     .await?;
//!
//! let mut tracker = QuotaTracker::from_config(ProviderKind::Anthropic, store, &config);
//! tracker.on_reset(|event| println!("{} reset ({})", event.key, event.reason));
//!
//! let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");
//! tracker.process(&QuotaReading::new(key, 42.0, chrono::Utc::now())).await?;
//! ```

pub mod config;
pub mod heuristic;
pub mod repair;
pub mod store;
pub mod summary;
pub mod timer;
pub mod tracker;
pub mod types;

// Re-export main types
pub use types::{
    Cycle, CycleClose, CycleReplacement, NewCycle, ProviderKind, QuotaKey, QuotaReading,
    SnapshotPoint, ValueUnit, WindowBounds,
};

// Re-export configuration
pub use config::{BoundaryRules, ProviderPolicy, QuotaMatcher, QuotaRule, TuningConfig};

// Re-export heuristics
pub use heuristic::{
    LastSeen, ResetContext, ResetHeuristic, ResetReason, ResetReference, ResetSignal,
};

// Re-export store
pub use store::{CycleStore, SqliteCycleStore, StoredCycle, StoredSnapshot};

// Re-export tracker
pub use tracker::{QuotaTracker, ResetEvent, ResetObserver, TrackOutcome};

// Re-export repair
pub use repair::{
    find_reset_boundaries, split_cycle, CycleRepairEngine, RepairResult, ResetBoundary,
    REPAIR_FLAG_DONE, REPAIR_FLAG_KEY,
};

// Re-export summary
pub use summary::{UsageSummarizer, UsageSummary};

// Re-export timer types
pub use timer::{
    PollReport, QuotaPoller, QuotaPollingConfig, QuotaPollingStatus, SharedPollingStatus,
    SnapshotSource, DEFAULT_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES,
};
