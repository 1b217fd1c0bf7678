use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serverbox_domain::{InstanceId, InstanceRecord};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::InstanceStore;

/// In-memory implementation of [`InstanceStore`].
///
/// All data is lost on process exit. Used for tests and for running
/// `serverbox` without a configured database path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<InstanceId, InstanceRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let guard = self.inner.read().await;
        let mut records: Vec<InstanceRecord> = guard.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn set(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.remove(id);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
