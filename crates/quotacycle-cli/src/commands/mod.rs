//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod cycles;
pub mod record;
pub mod repair;
pub mod summary;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quotacycle_core::{Database, SqliteCycleStore, TuningConfig};

use crate::output::Printer;

/// Shared context for all commands
pub struct Context {
    pub store: Arc<SqliteCycleStore>,
    pub config: TuningConfig,
    pub out: Printer,
}

impl Context {
    pub fn new(db: Database, config: TuningConfig, out: Printer) -> Self {
        Self {
            store: Arc::new(SqliteCycleStore::new(db.pool)),
            config,
            out,
        }
    }
}

/// Parse an RFC 3339 timestamp argument
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
}
