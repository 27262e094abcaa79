//! Durable storage
//!
//! SQLite archive of periodic snapshots behind its own [`ConnectionManager`],
//! so a storage outage only affects the durable branch of the router.

pub mod store;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{MeterSrvError, Result};
use crate::router::SnapshotSink;
use crate::runtime::{ConnectionManager, ConnectionState, Connector};
use crate::snapshot::DecodedSnapshot;

pub use store::{ensure_schema, ReadingDocument, ReadingStore};

/// Storage connection manager shared by every device's router
pub type StorageManager = ConnectionManager<SqliteConnector>;

/// Opens the SQLite reading archive
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    max_connections: u32,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, max_connections: u32) -> Self {
        Self {
            path: path.into(),
            max_connections: max_connections.max(1),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Connection = SqlitePool;

    fn target(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    async fn connect(&self) -> Result<SqlitePool> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| MeterSrvError::connection(format!("{}: {}", self.target(), e)))?;

        ensure_schema(&pool).await?;
        info!("SQLite reading archive ready: {}", self.path.display());
        Ok(pool)
    }
}

#[async_trait]
impl SnapshotSink for StorageManager {
    fn ready(&self) -> bool {
        self.ensure_ready() == ConnectionState::Ready
    }

    async fn persist(&self, snapshot: &DecodedSnapshot) -> Result<()> {
        let pool = self.handle().ok_or_else(MeterSrvError::not_connected)?;
        let store = ReadingStore::new(pool);

        if let Err(e) = store.insert(&ReadingDocument::from(snapshot)).await {
            // Let the manager re-open the archive before the next due write
            self.fault(e.to_string());
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Utc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::router::SinkRouter;
    use crate::runtime::ReconnectPolicy;
    use crate::snapshot::FieldValue;

    fn snapshot() -> DecodedSnapshot {
        let mut values = BTreeMap::new();
        values.insert(
            "VL1".to_string(),
            FieldValue {
                value: 230.5,
                unit: "V".to_string(),
                description: None,
            },
        );
        DecodedSnapshot::new("Meter-1", Utc::now(), values)
    }

    #[tokio::test]
    async fn test_connector_creates_schema_in_new_directory() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("readings.db");
        let connector = SqliteConnector::new(&path, 2);

        let pool = connector.connect().await.expect("connect");
        assert!(path.exists());
        assert_eq!(ReadingStore::new(pool).count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_storage_manager_persists_snapshot() {
        let dir = TempDir::new().expect("temp dir");
        let manager = StorageManager::new(
            SqliteConnector::new(dir.path().join("readings.db"), 2),
            ReconnectPolicy::default(),
            CancellationToken::new(),
        );

        assert!(manager.persist(&snapshot()).await.is_err());
        assert_eq!(manager.reconnect().await, ConnectionState::Ready);
        manager.persist(&snapshot()).await.expect("persist");

        let store = ReadingStore::new(manager.handle().expect("pool"));
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_router_writes_through_storage_manager() {
        let dir = TempDir::new().expect("temp dir");
        let manager = Arc::new(StorageManager::new(
            SqliteConnector::new(dir.path().join("readings.db"), 2),
            ReconnectPolicy::default(),
            CancellationToken::new(),
        ));
        manager.reconnect().await;

        let router = SinkRouter::new(Arc::clone(&manager), Duration::from_secs(120));
        let due = tokio::time::Instant::now() + Duration::from_secs(120);
        router
            .publish_at(snapshot(), due)
            .expect("write is due")
            .await
            .expect("persist task");

        let store = ReadingStore::new(manager.handle().expect("pool"));
        let rows = store
            .readings_between(Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_name, "Meter-1");
        assert_eq!(rows[0].data.get("VL1"), Some(&230.5));
    }
}
