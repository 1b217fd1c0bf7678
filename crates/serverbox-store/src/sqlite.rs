use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serverbox_domain::{InstanceId, InstanceRecord, InstanceState};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::store::InstanceStore;

// DDL — idempotent; run at every startup via migrate().
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id            TEXT PRIMARY KEY,
    sandbox_id    TEXT NOT NULL,
    state         TEXT NOT NULL,
    url           TEXT,
    preview_token TEXT,
    username      TEXT NOT NULL,
    password      TEXT NOT NULL,
    providers     TEXT NOT NULL,
    labels        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_created_at ON instances (created_at DESC);
"#;

/// Persistent instance store backed by an embedded SQLite database.
///
/// Single `instances` table; `providers` and `labels` are JSON-serialized
/// TEXT columns. Safe for the single-writer model this store is specified
/// for — all writes are expected to come from one `LifecycleManager`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if absent) the SQLite database at `path` and run schema
    /// migrations.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .map_err(|e| StoreError::Internal(format!("sqlite connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("migration: {e}")))?;
        Ok(())
    }
}

type Row = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_record(row: Row) -> Result<InstanceRecord, StoreError> {
    let (id, sandbox_id, state, url, preview_token, username, password, providers, labels, created_at, updated_at) = row;
    let providers: Vec<String> = serde_json::from_str(&providers)?;
    let labels: HashMap<String, String> = serde_json::from_str(&labels)?;
    Ok(InstanceRecord {
        id: InstanceId::new(id),
        sandbox_id,
        state: InstanceState::from_persisted(&state),
        url,
        preview_token,
        username,
        password,
        providers,
        labels,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        let row: Option<Row> = sqlx::query_as(
            "SELECT id, sandbox_id, state, url, preview_token, username, password, providers, labels, created_at, updated_at
             FROM instances WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT id, sandbox_id, state, url, preview_token, username, password, providers, labels, created_at, updated_at
             FROM instances ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn set(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let providers = serde_json::to_string(&record.providers)?;
        let labels = serde_json::to_string(&record.labels)?;
        sqlx::query(
            "INSERT INTO instances
                (id, sandbox_id, state, url, preview_token, username, password, providers, labels, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                sandbox_id = excluded.sandbox_id,
                state = excluded.state,
                url = excluded.url,
                preview_token = excluded.preview_token,
                username = excluded.username,
                password = excluded.password,
                providers = excluded.providers,
                labels = excluded.labels,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
        )
        .bind(record.id.as_str())
        .bind(&record.sandbox_id)
        .bind(record.state.to_string())
        .bind(&record.url)
        .bind(&record.preview_token)
        .bind(&record.username)
        .bind(&record.password)
        .bind(providers)
        .bind(labels)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

// Requires a writable filesystem; exercised via a tempfile-backed path so the
// suite doesn't touch the developer's working directory.
#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serverbox.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    fn dummy(id: &str) -> InstanceRecord {
        InstanceRecord::new_running(
            InstanceId::new(id),
            format!("sbx-{id}"),
            "http://u".into(),
            Some("tok".into()),
            "user".into(),
            "pw".into(),
            vec!["opencode".into()],
            HashMap::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn round_trip_set_get() {
        let (store, _dir) = temp_store().await;
        let rec = dummy("sq-1");
        store.set(&rec).await.unwrap();
        let got = store.get(&InstanceId::new("sq-1")).await.unwrap().unwrap();
        assert_eq!(got.id, rec.id);
        assert_eq!(got.sandbox_id, rec.sandbox_id);
        assert_eq!(got.url, rec.url);
        assert_eq!(got.providers, rec.providers);
    }

    #[tokio::test]
    async fn unknown_state_degrades_to_error_on_read() {
        let (store, _dir) = temp_store().await;
        let rec = dummy("sq-2");
        store.set(&rec).await.unwrap();
        sqlx::query("UPDATE instances SET state = 'bogus' WHERE id = ?")
            .bind("sq-2")
            .execute(&store.pool)
            .await
            .unwrap();
        let got = store.get(&InstanceId::new("sq-2")).await.unwrap().unwrap();
        assert_eq!(got.state, InstanceState::Error);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, _dir) = temp_store().await;
        store.set(&dummy("sq-3")).await.unwrap();
        store.delete(&InstanceId::new("sq-3")).await.unwrap();
        store.delete(&InstanceId::new("sq-3")).await.unwrap();
        assert!(store.get(&InstanceId::new("sq-3")).await.unwrap().is_none());
    }
}
