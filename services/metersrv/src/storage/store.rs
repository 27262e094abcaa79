//! Append-only reading archive
//!
//! One row per persisted snapshot. `data` holds the `{field: value}` object as
//! JSON text and `timestamp` is UTC epoch milliseconds, indexed for the
//! day/month/year range queries.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{MeterSrvError, Result};
use crate::snapshot::DecodedSnapshot;

const READINGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_name TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        data TEXT NOT NULL
    )
"#;

const READINGS_TIMESTAMP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp)";

/// Persisted form of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingDocument {
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: BTreeMap<String, f64>,
}

impl From<&DecodedSnapshot> for ReadingDocument {
    fn from(snapshot: &DecodedSnapshot) -> Self {
        Self {
            device_name: snapshot.device.clone(),
            timestamp: snapshot.captured_at,
            data: snapshot.data(),
        }
    }
}

/// Create the readings table and its index if missing
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(READINGS_TABLE).execute(pool).await?;
    sqlx::query(READINGS_TIMESTAMP_INDEX).execute(pool).await?;
    Ok(())
}

/// Queries and inserts over the `readings` table
#[derive(Debug, Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
}

impl ReadingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one reading, returning its row id
    pub async fn insert(&self, reading: &ReadingDocument) -> Result<i64> {
        let data = serde_json::to_string(&reading.data)?;
        let result =
            sqlx::query("INSERT INTO readings (device_name, timestamp, data) VALUES (?, ?, ?)")
                .bind(&reading.device_name)
                .bind(reading.timestamp.timestamp_millis())
                .bind(data)
                .execute(&self.pool)
                .await?;

        debug!(
            "Inserted reading {} for {}",
            result.last_insert_rowid(),
            reading.device_name
        );
        Ok(result.last_insert_rowid())
    }

    /// Readings with `start <= timestamp <= end`, oldest first
    pub async fn readings_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReadingDocument>> {
        let rows = sqlx::query(
            "SELECT device_name, timestamp, data FROM readings \
             WHERE timestamp >= ? AND timestamp <= ? \
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut readings = Vec::with_capacity(rows.len());
        for row in rows {
            let device_name: String = row.try_get("device_name")?;
            let millis: i64 = row.try_get("timestamp")?;
            let data: String = row.try_get("data")?;

            let timestamp = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                MeterSrvError::storage(format!("timestamp {millis} out of range"))
            })?;
            readings.push(ReadingDocument {
                device_name,
                timestamp,
                data: serde_json::from_str(&data)?,
            });
        }
        Ok(readings)
    }

    /// Readings within one UTC calendar day
    pub async fn readings_on_day(&self, day: NaiveDate) -> Result<Vec<ReadingDocument>> {
        let next = day
            .succ_opt()
            .ok_or_else(|| MeterSrvError::storage(format!("no day after {day}")))?;
        self.readings_in_dates(day, next).await
    }

    /// Readings within one UTC calendar month (`month` is 1..=12)
    pub async fn readings_in_month(&self, year: i32, month: u32) -> Result<Vec<ReadingDocument>> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| MeterSrvError::storage(format!("invalid month {year}-{month}")))?;
        let next = if first.month() == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| MeterSrvError::storage(format!("no month after {year}-{month}")))?;
        self.readings_in_dates(first, next).await
    }

    /// Readings within one UTC calendar year
    pub async fn readings_in_year(&self, year: i32) -> Result<Vec<ReadingDocument>> {
        let first = NaiveDate::from_ymd_opt(year, 1, 1)
            .ok_or_else(|| MeterSrvError::storage(format!("invalid year {year}")))?;
        let next = NaiveDate::from_ymd_opt(year + 1, 1, 1)
            .ok_or_else(|| MeterSrvError::storage(format!("no year after {year}")))?;
        self.readings_in_dates(first, next).await
    }

    /// Total rows stored
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// `[first, next)` as an inclusive millisecond range
    async fn readings_in_dates(
        &self,
        first: NaiveDate,
        next: NaiveDate,
    ) -> Result<Vec<ReadingDocument>> {
        let start = first.and_time(NaiveTime::MIN).and_utc();
        let end = next.and_time(NaiveTime::MIN).and_utc() - Duration::milliseconds(1);
        self.readings_between(start, end).await
    }
}
