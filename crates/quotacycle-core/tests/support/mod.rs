#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quotacycle_core::services::quota::{
    Cycle, CycleClose, CycleReplacement, CycleStore, NewCycle, ProviderKind, QuotaKey,
    QuotaReading, SnapshotPoint, SqliteCycleStore,
};
use quotacycle_core::{Error, Result};

/// SQLite store that fails selected operations on demand
pub struct FaultyStore {
    inner: Arc<SqliteCycleStore>,
    armed: Mutex<Vec<&'static str>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteCycleStore>) -> Self {
        Self {
            inner,
            armed: Mutex::new(Vec::new()),
        }
    }

    /// Make the next call of `operation` fail without touching the database
    pub fn fail_next(&self, operation: &'static str) {
        self.armed.lock().unwrap().push(operation);
    }

    fn check(&self, operation: &str) -> Result<()> {
        let mut armed = self.armed.lock().unwrap();
        match armed.iter().position(|op| *op == operation) {
            Some(pos) => {
                armed.remove(pos);
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CycleStore for FaultyStore {
    async fn query_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>> {
        self.check("query_active_cycle")?;
        self.inner.query_active_cycle(key).await
    }
    async fn create_cycle(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        expected_reset: Option<DateTime<Utc>>,
        initial_peak: f64,
    ) -> Result<i64> {
        self.check("create_cycle")?;
        self.inner.create_cycle(key, start, expected_reset, initial_peak).await
    }
    async fn update_cycle(&self, key: &QuotaKey, peak: f64, delta: f64) -> Result<()> {
        self.check("update_cycle")?;
        self.inner.update_cycle(key, peak, delta).await
    }
    async fn update_cycle_with_reset(
        &self,
        key: &QuotaKey,
        peak: f64,
        delta: f64,
        expected_reset: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check("update_cycle_with_reset")?;
        self.inner
            .update_cycle_with_reset(key, peak, delta, expected_reset)
            .await
    }
    async fn close_cycle(&self, key: &QuotaKey, close: CycleClose) -> Result<()> {
        self.check("close_cycle")?;
        self.inner.close_cycle(key, close).await
    }
    async fn roll_over_cycle(&self, key: &QuotaKey, close: CycleClose, next: &NewCycle) -> Result<i64> {
        self.check("roll_over_cycle")?;
        self.inner.roll_over_cycle(key, close, next).await
    }
    async fn query_cycle_history(&self, key: &QuotaKey, limit: Option<u32>) -> Result<Vec<Cycle>> {
        self.check("query_cycle_history")?;
        self.inner.query_cycle_history(key, limit).await
    }
    async fn query_quota_keys(&self, provider: ProviderKind) -> Result<Vec<String>> {
        self.check("query_quota_keys")?;
        self.inner.query_quota_keys(provider).await
    }
    async fn insert_snapshot(&self, reading: &QuotaReading) -> Result<()> {
        self.check("insert_snapshot")?;
        self.inner.insert_snapshot(reading).await
    }
    async fn query_snapshots_in_range(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SnapshotPoint>> {
        self.check("query_snapshots_in_range")?;
        self.inner.query_snapshots_in_range(key, start, end).await
    }
    async fn query_latest_snapshot(&self, key: &QuotaKey) -> Result<Option<SnapshotPoint>> {
        self.check("query_latest_snapshot")?;
        self.inner.query_latest_snapshot(key).await
    }
    async fn delete_cycle(&self, id: i64) -> Result<()> {
        self.check("delete_cycle")?;
        self.inner.delete_cycle(id).await
    }
    async fn insert_cycle(&self, key: &QuotaKey, cycle: &NewCycle) -> Result<i64> {
        self.check("insert_cycle")?;
        self.inner.insert_cycle(key, cycle).await
    }
    async fn replace_cycles(
        &self,
        key: &QuotaKey,
        replacements: &[CycleReplacement],
    ) -> Result<Vec<i64>> {
        self.check("replace_cycles")?;
        self.inner.replace_cycles(key, replacements).await
    }
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.check("get_setting")?;
        self.inner.get_setting(key).await
    }
    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check("set_setting")?;
        self.inner.set_setting(key, value).await
    }
}
