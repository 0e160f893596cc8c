use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use types::{CollaboratorError, MeasurementBatch, TimeSeriesSink};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "renogy-timeseries.sqlite".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// One stored point, as read back from the `measurements` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub time_ms: i64,
    pub category: String,
    pub uname: String,
    pub name: String,
    pub sku: String,
    pub sub: String,
    pub measure: String,
    pub value: f64,
}

/// Local SQLite point store, one row per measurement.
#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    pool: SqlitePool,
}

impl TimeSeriesStore {
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&sqlite_url(&config.path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS measurements (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                time_ms INTEGER NOT NULL,\
                category TEXT NOT NULL,\
                uname TEXT NOT NULL,\
                name TEXT NOT NULL,\
                sku TEXT NOT NULL,\
                sub TEXT NOT NULL,\
                measure TEXT NOT NULL,\
                value REAL NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_measurements_time ON measurements(time_ms)")
            .execute(&pool)
            .await?;

        info!(path = %config.path, "time-series store initialized");

        Ok(Self { pool })
    }

    /// Inserts every measurement of the batch in a single transaction.
    pub async fn insert_batch(&self, batch: &MeasurementBatch) -> Result<u64, StoreError> {
        let time_ms = i64::try_from(batch.timestamp_ms).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;
        let mut rows = 0u64;

        for measurement in &batch.measurements {
            let result = sqlx::query(
                "INSERT INTO measurements \
                 (time_ms, category, uname, name, sku, sub, measure, value) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(time_ms)
            .bind(&measurement.category_label)
            .bind(&measurement.device_identity)
            .bind(&measurement.display_name)
            .bind(&measurement.sku)
            .bind(measurement.sub_channel_or_none())
            .bind(measurement.measure_kind.as_str())
            .bind(measurement.value)
            .execute(&mut *tx)
            .await?;
            rows += result.rows_affected();
        }

        tx.commit().await?;
        debug!(rows, time_ms, "time-series batch stored");
        Ok(rows)
    }

    pub async fn points_at(&self, time_ms: i64) -> Result<Vec<StoredPoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT time_ms, category, uname, name, sku, sub, measure, value \
             FROM measurements WHERE time_ms = ? ORDER BY id ASC",
        )
        .bind(time_ms)
        .fetch_all(&self.pool)
        .await?;

        let points = rows
            .into_iter()
            .map(|row| StoredPoint {
                time_ms: row.get::<i64, _>("time_ms"),
                category: row.get::<String, _>("category"),
                uname: row.get::<String, _>("uname"),
                name: row.get::<String, _>("name"),
                sku: row.get::<String, _>("sku"),
                sub: row.get::<String, _>("sub"),
                measure: row.get::<String, _>("measure"),
                value: row.get::<f64, _>("value"),
            })
            .collect();

        Ok(points)
    }

    pub async fn point_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM measurements")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    /// Deletes points older than `cutoff_ms`; returns the number removed.
    pub async fn prune_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM measurements WHERE time_ms < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TimeSeriesSink for TimeSeriesStore {
    async fn write_batch(&self, batch: &MeasurementBatch) -> Result<(), CollaboratorError> {
        self.insert_batch(batch)
            .await
            .map(|_| ())
            .map_err(|err| CollaboratorError::write(batch.len(), err))
    }
}

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    }
}
