//! Services module - business logic

pub mod quota;

pub use quota::{
    CycleRepairEngine, CycleStore, ProviderKind, QuotaKey, QuotaPoller, QuotaReading,
    QuotaTracker, RepairResult, ResetEvent, ResetReason, SqliteCycleStore, TrackOutcome,
    TuningConfig, UsageSummarizer, UsageSummary,
};
