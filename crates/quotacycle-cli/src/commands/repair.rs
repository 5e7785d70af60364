//! Repair command

use anyhow::Result;
use quotacycle_core::{CycleRepairEngine, RepairResult};
use tabled::Tabled;

use super::Context;

/// Repair result row for table display
#[derive(Debug, Tabled)]
pub struct RepairRow {
    #[tabled(rename = "Provider")]
    pub provider: String,
    #[tabled(rename = "Quota")]
    pub quota_key: String,
    #[tabled(rename = "Examined")]
    pub examined: usize,
    #[tabled(rename = "Fixed")]
    pub fixed: usize,
    #[tabled(rename = "Created")]
    pub created: usize,
    #[tabled(rename = "Skipped")]
    pub skipped: usize,
    #[tabled(rename = "Snapshots")]
    pub snapshots: usize,
}

impl From<&RepairResult> for RepairRow {
    fn from(r: &RepairResult) -> Self {
        Self {
            provider: r.provider.to_string(),
            quota_key: r.quota_key.clone(),
            examined: r.cycles_examined,
            fixed: r.cycles_fixed,
            created: r.cycles_created,
            skipped: r.cycles_skipped,
            snapshots: r.snapshots_used,
        }
    }
}

pub async fn execute(ctx: &Context, force: bool) -> Result<()> {
    let engine = CycleRepairEngine::new(ctx.store.clone(), ctx.config.clone());

    if !force && engine.is_completed().await? {
        ctx.out
            .info("Cycle repair already completed (use --force to run again)");
        if ctx.out.is_json() {
            ctx.out.emit::<[RepairResult], RepairRow>(&[], &[])?;
        }
        return Ok(());
    }

    let results = engine.force_repair().await?;
    let rows: Vec<RepairRow> = results.iter().map(RepairRow::from).collect();
    ctx.out.emit(&results, &rows)?;

    let fixed: usize = results.iter().map(|r| r.cycles_fixed).sum();
    let created: usize = results.iter().map(|r| r.cycles_created).sum();
    ctx.out.success(&format!(
        "Repair complete: {} cycles fixed, {} created",
        fixed, created
    ));

    Ok(())
}
