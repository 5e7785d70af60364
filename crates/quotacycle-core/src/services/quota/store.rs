//! Cycle storage layer
//!
//! [`CycleStore`] is the persistence boundary used by the tracker, repair
//! engine and summarizer. [`SqliteCycleStore`] implements it over the
//! `reset_cycles`, `quota_snapshots` and `settings` tables.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::error::{Error, Result};

use super::types::{
    Cycle, CycleClose, CycleReplacement, NewCycle, ProviderKind, QuotaKey, QuotaReading,
    SnapshotPoint,
};

// ============================================================================
// Store Interface
// ============================================================================

/// Durable storage for cycles, snapshot history and settings
#[async_trait]
pub trait CycleStore: Send + Sync {
    /// The open cycle for a quota, if any
    async fn query_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>>;

    /// Open a new cycle; fails if one is already active
    async fn create_cycle(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        expected_reset: Option<DateTime<Utc>>,
        initial_peak: f64,
    ) -> Result<i64>;

    /// Write peak and delta of the active cycle
    async fn update_cycle(&self, key: &QuotaKey, peak_value: f64, cumulative_delta: f64)
        -> Result<()>;

    /// Write peak, delta and expected reset of the active cycle in one statement
    async fn update_cycle_with_reset(
        &self,
        key: &QuotaKey,
        peak_value: f64,
        cumulative_delta: f64,
        expected_reset: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Close the active cycle
    async fn close_cycle(&self, key: &QuotaKey, close: CycleClose) -> Result<()>;

    /// Close the active cycle and open its successor in one transaction
    async fn roll_over_cycle(&self, key: &QuotaKey, close: CycleClose, next: &NewCycle)
        -> Result<i64>;

    /// Closed cycles, newest first
    async fn query_cycle_history(&self, key: &QuotaKey, limit: Option<u32>) -> Result<Vec<Cycle>>;

    /// Quota keys that have cycles for a provider
    async fn query_quota_keys(&self, provider: ProviderKind) -> Result<Vec<String>>;

    /// Append a raw reading to snapshot history
    async fn insert_snapshot(&self, reading: &QuotaReading) -> Result<()>;

    /// Snapshot points within `[start, end]`, oldest first
    async fn query_snapshots_in_range(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SnapshotPoint>>;

    /// Most recent snapshot point for a quota
    async fn query_latest_snapshot(&self, key: &QuotaKey) -> Result<Option<SnapshotPoint>>;

    async fn delete_cycle(&self, id: i64) -> Result<()>;

    async fn insert_cycle(&self, key: &QuotaKey, cycle: &NewCycle) -> Result<i64>;

    /// Delete bad cycles and insert their replacements in one transaction
    async fn replace_cycles(
        &self,
        key: &QuotaKey,
        replacements: &[CycleReplacement],
    ) -> Result<Vec<i64>>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

// ============================================================================
// Database Row Types
// ============================================================================

/// Database row representation of a cycle
///
/// This struct maps directly to the `reset_cycles` table schema.
#[derive(Debug, Clone, FromRow)]
pub struct StoredCycle {
    pub id: i64,
    pub provider: String,
    pub quota_key: String,
    pub cycle_start: String,
    pub cycle_end: Option<String>,
    pub expected_reset: Option<String>,
    pub peak_value: f64,
    pub cumulative_delta: f64,
}

impl StoredCycle {
    /// Convert database row to Cycle
    pub fn to_cycle(&self) -> Result<Cycle> {
        let provider = self
            .provider
            .parse::<ProviderKind>()
            .map_err(|e| Error::corrupt(format!("cycle {}: {}", self.id, e)))?;

        Ok(Cycle {
            id: self.id,
            key: QuotaKey::new(provider, self.quota_key.clone()),
            cycle_start: required_datetime(&self.cycle_start)?,
            cycle_end: optional_datetime(self.cycle_end.as_deref())?,
            expected_reset: optional_datetime(self.expected_reset.as_deref())?,
            peak_value: self.peak_value,
            cumulative_delta: self.cumulative_delta,
        })
    }
}

/// Database row representation of a snapshot point
#[derive(Debug, Clone, FromRow)]
pub struct StoredSnapshot {
    pub captured_at: String,
    pub value: f64,
    pub expected_reset: Option<String>,
}

impl StoredSnapshot {
    pub fn to_point(&self) -> Result<SnapshotPoint> {
        Ok(SnapshotPoint {
            captured_at: required_datetime(&self.captured_at)?,
            value: self.value,
            expected_reset: optional_datetime(self.expected_reset.as_deref())?,
        })
    }
}

/// Fixed-width UTC timestamp, so lexical order matches time order
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse datetime string (supports both RFC3339 and NaiveDateTime formats)
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }

    log::warn!("[quota:store] Failed to parse datetime: {}", s);
    None
}

fn required_datetime(s: &str) -> Result<DateTime<Utc>> {
    parse_datetime(s).ok_or_else(|| Error::corrupt(format!("invalid timestamp '{}'", s)))
}

fn optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(required_datetime).transpose()
}

fn format_optional(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(format_timestamp)
}

// ============================================================================
// Connection-level helpers (shared by pool and transaction paths)
// ============================================================================

async fn insert_cycle_row(conn: &mut SqliteConnection, key: &QuotaKey, cycle: &NewCycle) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO reset_cycles
        (provider, quota_key, cycle_start, cycle_end, expected_reset, peak_value, cumulative_delta)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key.provider.as_str())
    .bind(&key.quota)
    .bind(format_timestamp(cycle.start))
    .bind(format_optional(cycle.end))
    .bind(format_optional(cycle.expected_reset))
    .bind(cycle.peak_value)
    .bind(cycle.cumulative_delta)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn close_active_row(conn: &mut SqliteConnection, key: &QuotaKey, close: CycleClose) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE reset_cycles
        SET cycle_end = ?, peak_value = ?, cumulative_delta = ?
        WHERE provider = ? AND quota_key = ? AND cycle_end IS NULL
        "#,
    )
    .bind(format_timestamp(close.end))
    .bind(close.peak_value)
    .bind(close.cumulative_delta)
    .bind(key.provider.as_str())
    .bind(&key.quota)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::validation(format!("no active cycle for {}", key)));
    }
    Ok(())
}

async fn delete_cycle_row(conn: &mut SqliteConnection, key: Option<&QuotaKey>, id: i64) -> Result<()> {
    let result = match key {
        Some(key) => {
            sqlx::query("DELETE FROM reset_cycles WHERE id = ? AND provider = ? AND quota_key = ?")
                .bind(id)
                .bind(key.provider.as_str())
                .bind(&key.quota)
                .execute(&mut *conn)
                .await?
        }
        None => {
            sqlx::query("DELETE FROM reset_cycles WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?
        }
    };

    if result.rows_affected() == 0 {
        return Err(Error::validation(format!("cycle {} not found", id)));
    }
    Ok(())
}

// ============================================================================
// SqliteCycleStore
// ============================================================================

const CYCLE_COLUMNS: &str =
    "id, provider, quota_key, cycle_start, cycle_end, expected_reset, peak_value, cumulative_delta";

/// SQLite-backed [`CycleStore`]
#[derive(Clone)]
pub struct SqliteCycleStore {
    pool: SqlitePool,
}

impl SqliteCycleStore {
    /// Create a new store with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CycleStore for SqliteCycleStore {
    async fn query_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>> {
        let row = sqlx::query_as::<_, StoredCycle>(&format!(
            "SELECT {} FROM reset_cycles WHERE provider = ? AND quota_key = ? AND cycle_end IS NULL",
            CYCLE_COLUMNS
        ))
        .bind(key.provider.as_str())
        .bind(&key.quota)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.to_cycle()).transpose()
    }

    async fn create_cycle(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        expected_reset: Option<DateTime<Utc>>,
        initial_peak: f64,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let id = insert_cycle_row(
            &mut conn,
            key,
            &NewCycle::active(start, expected_reset, initial_peak),
        )
        .await?;

        log::debug!("[quota:store] Created cycle {} for {}", id, key);
        Ok(id)
    }

    async fn update_cycle(
        &self,
        key: &QuotaKey,
        peak_value: f64,
        cumulative_delta: f64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reset_cycles
            SET peak_value = ?, cumulative_delta = ?
            WHERE provider = ? AND quota_key = ? AND cycle_end IS NULL
            "#,
        )
        .bind(peak_value)
        .bind(cumulative_delta)
        .bind(key.provider.as_str())
        .bind(&key.quota)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::validation(format!("no active cycle for {}", key)));
        }
        Ok(())
    }

    async fn update_cycle_with_reset(
        &self,
        key: &QuotaKey,
        peak_value: f64,
        cumulative_delta: f64,
        expected_reset: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reset_cycles
            SET peak_value = ?, cumulative_delta = ?, expected_reset = ?
            WHERE provider = ? AND quota_key = ? AND cycle_end IS NULL
            "#,
        )
        .bind(peak_value)
        .bind(cumulative_delta)
        .bind(format_optional(expected_reset))
        .bind(key.provider.as_str())
        .bind(&key.quota)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::validation(format!("no active cycle for {}", key)));
        }
        Ok(())
    }

    async fn close_cycle(&self, key: &QuotaKey, close: CycleClose) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        close_active_row(&mut conn, key, close).await
    }

    async fn roll_over_cycle(
        &self,
        key: &QuotaKey,
        close: CycleClose,
        next: &NewCycle,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        close_active_row(&mut tx, key, close).await?;
        let id = insert_cycle_row(&mut tx, key, next).await?;
        tx.commit().await?;

        log::debug!("[quota:store] Rolled over {} into cycle {}", key, id);
        Ok(id)
    }

    async fn query_cycle_history(&self, key: &QuotaKey, limit: Option<u32>) -> Result<Vec<Cycle>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query_as::<_, StoredCycle>(&format!(
            r#"
            SELECT {} FROM reset_cycles
            WHERE provider = ? AND quota_key = ? AND cycle_end IS NOT NULL
            ORDER BY cycle_start DESC, id DESC
            LIMIT ?
            "#,
            CYCLE_COLUMNS
        ))
        .bind(key.provider.as_str())
        .bind(&key.quota)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(StoredCycle::to_cycle).collect()
    }

    async fn query_quota_keys(&self, provider: ProviderKind) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT quota_key FROM reset_cycles WHERE provider = ? ORDER BY quota_key",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(quota,)| quota).collect())
    }

    async fn insert_snapshot(&self, reading: &QuotaReading) -> Result<()> {
        let (window_start, window_end) = reading
            .window
            .map(|w| (format_optional(w.start), format_optional(w.end)))
            .unwrap_or((None, None));

        sqlx::query(
            r#"
            INSERT INTO quota_snapshots
            (provider, quota_key, captured_at, value, expected_reset, window_start, window_end)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.key.provider.as_str())
        .bind(&reading.key.quota)
        .bind(format_timestamp(reading.captured_at))
        .bind(reading.value)
        .bind(format_optional(reading.expected_reset))
        .bind(window_start)
        .bind(window_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_snapshots_in_range(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SnapshotPoint>> {
        let rows = sqlx::query_as::<_, StoredSnapshot>(
            r#"
            SELECT captured_at, value, expected_reset
            FROM quota_snapshots
            WHERE provider = ? AND quota_key = ? AND captured_at >= ? AND captured_at <= ?
            ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(key.provider.as_str())
        .bind(&key.quota)
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .fetch_all(&self.pool)
        .await?;

        log::debug!(
            "[quota:store] Loaded {} snapshots for {} in range",
            rows.len(),
            key
        );

        rows.iter().map(StoredSnapshot::to_point).collect()
    }

    async fn query_latest_snapshot(&self, key: &QuotaKey) -> Result<Option<SnapshotPoint>> {
        let row = sqlx::query_as::<_, StoredSnapshot>(
            r#"
            SELECT captured_at, value, expected_reset
            FROM quota_snapshots
            WHERE provider = ? AND quota_key = ?
            ORDER BY captured_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(key.provider.as_str())
        .bind(&key.quota)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.to_point()).transpose()
    }

    async fn delete_cycle(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        delete_cycle_row(&mut conn, None, id).await
    }

    async fn insert_cycle(&self, key: &QuotaKey, cycle: &NewCycle) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_cycle_row(&mut conn, key, cycle).await
    }

    async fn replace_cycles(
        &self,
        key: &QuotaKey,
        replacements: &[CycleReplacement],
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for replacement in replacements {
            delete_cycle_row(&mut tx, Some(key), replacement.bad_cycle_id).await?;
            for cycle in &replacement.replacements {
                inserted.push(insert_cycle_row(&mut tx, key, cycle).await?);
            }
        }

        tx.commit().await?;

        log::info!(
            "[quota:store] Replaced {} cycles for {} with {}",
            replacements.len(),
            key,
            inserted.len()
        );
        Ok(inserted)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
