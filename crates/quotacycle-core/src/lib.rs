//! # quotacycle-core
//!
//! Reset-cycle tracking for LLM provider quotas.
//!
//! This crate provides:
//! - Database setup and migrations (`db` module)
//! - Cycle tracking, repair and summaries (`services::quota` module)
//! - Unified error handling (`error` module)

pub mod db;
pub mod error;
pub mod services;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};

pub use services::{
    CycleRepairEngine, CycleStore, ProviderKind, QuotaKey, QuotaPoller, QuotaReading,
    QuotaTracker, RepairResult, ResetEvent, ResetReason, SqliteCycleStore, TrackOutcome,
    TuningConfig, UsageSummarizer, UsageSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
