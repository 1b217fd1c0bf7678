use async_trait::async_trait;
use serverbox_domain::{InstanceId, InstanceRecord};

use crate::error::StoreError;

/// Durable key→record mapping for instances. Implementations must be
/// crash-safe at per-operation granularity; readers may run concurrently but
/// all writes are expected to come from a single caller (the lifecycle
/// manager is the sole writer).
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError>;

    /// Ordered by `created_at` descending.
    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Upsert by `id`.
    async fn set(&self, record: &InstanceRecord) -> Result<(), StoreError>;

    async fn delete(&self, id: &InstanceId) -> Result<(), StoreError>;

    /// Release any held resources (connection pool, file handle). Called once
    /// during graceful shutdown.
    async fn close(&self) -> Result<(), StoreError>;
}
