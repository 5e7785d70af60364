//! Database module - SQLx with SQLite

use crate::error::{Error, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::PathBuf;

/// Environment variable overriding the database location
pub const DB_PATH_ENV: &str = "QUOTACYCLE_DB_PATH";

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Create a new database connection with a specific path
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        log::info!("Connecting to database: {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        log::info!("Running database migrations...");

        // One row per reset-to-reset window; cycle_end is NULL while active
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reset_cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                quota_key TEXT NOT NULL,
                cycle_start TEXT NOT NULL,
                cycle_end TEXT,
                expected_reset TEXT,
                peak_value REAL NOT NULL DEFAULT 0,
                cumulative_delta REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active cycle per quota
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_reset_cycles_active ON reset_cycles(provider, quota_key) WHERE cycle_end IS NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reset_cycles_start ON reset_cycles(provider, quota_key, cycle_start)",
        )
        .execute(&self.pool)
        .await?;

        // Raw readings, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                quota_key TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                value REAL NOT NULL,
                expected_reset TEXT,
                window_start TEXT,
                window_end TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_quota_snapshots_captured ON quota_snapshots(provider, quota_key, captured_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        log::info!("Database migrations completed");
        Ok(())
    }
}

/// Get database file path
/// Priority: QUOTACYCLE_DB_PATH env var > default app data directory
pub fn get_db_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let dirs = directories::ProjectDirs::from("com", "quotacycle", "QuotaCycle")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join("quotacycle.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var tests must not run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::remove_var(DB_PATH_ENV);
        let path = get_db_path().unwrap();
        assert!(path.to_string_lossy().contains("quotacycle.db"));
    }

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_quotacycle.db";
        std::env::set_var(DB_PATH_ENV, test_path);
        let path = get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var(DB_PATH_ENV);
    }

    #[tokio::test]
    async fn test_open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("nested").join("q.db"))
            .await
            .unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["quota_snapshots", "reset_cycles", "settings"]);
    }

    #[tokio::test]
    async fn test_migrations_are_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.db");
        let first = Database::open(path.clone()).await.unwrap();
        first.pool.close().await;
        assert!(Database::open(path).await.is_ok());
    }
}
