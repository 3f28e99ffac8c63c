//! Persistence boundary: one operation, batch upsert keyed on the natural
//! key. The orchestrator only ever talks to this trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pv_client::domain::UnifiedMeasurement;
use sqlx::PgPool;
use time::OffsetDateTime;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("upsert failed: {0}")]
    Upsert(String),
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Writes a batch, replacing rows that share `(logger_id, timestamp)`.
    /// Returns the number of rows written. Atomicity per batch is the
    /// store's responsibility.
    async fn upsert(&self, batch: &[UnifiedMeasurement]) -> Result<u64, StoreError>;
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeasurementStore for PostgresStore {
    async fn upsert(&self, batch: &[UnifiedMeasurement]) -> Result<u64, StoreError> {
        pv_client::db::upsert_measurements(&self.pool, batch)
            .await
            .map_err(|e| StoreError::Upsert(e.to_string()))
    }
}

/// In-memory store with the same upsert semantics as the database, used by
/// tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: tokio::sync::Mutex<HashMap<(String, OffsetDateTime), UnifiedMeasurement>>,
    upsert_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, logger_id: &str, ts: OffsetDateTime) -> Option<UnifiedMeasurement> {
        self.rows
            .lock()
            .await
            .get(&(logger_id.to_string(), ts))
            .cloned()
    }

    /// Number of upsert batches received, for asserting batching behavior.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn upsert(&self, batch: &[UnifiedMeasurement]) -> Result<u64, StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::Relaxed);
        let mut rows = self.rows.lock().await;
        for m in batch {
            rows.insert((m.logger_id.clone(), m.timestamp), m.clone());
        }
        Ok(batch.len() as u64)
    }
}
