//! Cycles command

use anyhow::Result;
use quotacycle_core::services::quota::{Cycle, CycleStore};
use quotacycle_core::{ProviderKind, QuotaKey};
use tabled::Tabled;

use super::Context;
use crate::output::{cell_time, cell_value};

/// Cycle row for table display
#[derive(Debug, Tabled)]
pub struct CycleRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "Start")]
    pub start: String,
    #[tabled(rename = "End")]
    pub end: String,
    #[tabled(rename = "Expected Reset")]
    pub expected_reset: String,
    #[tabled(rename = "Peak")]
    pub peak: String,
    #[tabled(rename = "Delta")]
    pub delta: String,
}

impl From<&Cycle> for CycleRow {
    fn from(c: &Cycle) -> Self {
        Self {
            id: c.id,
            start: cell_time(Some(c.cycle_start)),
            end: c
                .cycle_end
                .map(|t| cell_time(Some(t)))
                .unwrap_or_else(|| "active".to_string()),
            expected_reset: cell_time(c.expected_reset),
            peak: cell_value(c.peak_value),
            delta: cell_value(c.cumulative_delta),
        }
    }
}

pub async fn execute(
    ctx: &Context,
    provider: ProviderKind,
    quota: String,
    limit: Option<u32>,
) -> Result<()> {
    let key = QuotaKey::new(provider, quota);
    let active = ctx.store.query_active_cycle(&key).await?;
    let history = ctx.store.query_cycle_history(&key, limit).await?;

    // Active cycle first, then closed cycles newest first
    let cycles: Vec<Cycle> = active.into_iter().chain(history).collect();

    let rows: Vec<CycleRow> = cycles.iter().map(CycleRow::from).collect();
    ctx.out.emit(&cycles, &rows)
}
