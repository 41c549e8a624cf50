//! Document store using SQLite
//!
//! Persists trigger documents for durability across restarts.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::path::Path;

use super::{BulkItemResult, BulkOperation, BulkResponse, DocumentStore, MultiGetItem, Refresh};
use crate::error::{Result, StoreError};

/// SQLite-based document store
pub struct SqliteDocumentStore {
    pool: Pool<Sqlite>,
}

impl SqliteDocumentStore {
    /// Create a new store from database path
    pub async fn from_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidConfig(format!("Failed to create directory: {}", e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Document(format!("Migration failed (documents): {}", e)))?;
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT body FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        self.read(id).await
    }

    async fn multi_get(&self, ids: &[String]) -> Result<Vec<MultiGetItem>> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let item = match self.read(id).await {
                Ok(Some(source)) => MultiGetItem::Found {
                    id: id.clone(),
                    source,
                },
                Ok(None) => MultiGetItem::Missing { id: id.clone() },
                Err(e) => MultiGetItem::Failed {
                    id: id.clone(),
                    reason: e.to_string(),
                },
            };
            items.push(item);
        }
        Ok(items)
    }

    async fn bulk(&self, operations: Vec<BulkOperation>, _refresh: Refresh) -> Result<BulkResponse> {
        // Committed rows are visible to every later read, so both refresh
        // modes behave the same here.
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut response = BulkResponse::default();

        for op in operations {
            let outcome = match &op {
                BulkOperation::Index { id, source } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (id, body, updated_at) VALUES (?, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(id)
                    .bind(source.to_string())
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                }
                BulkOperation::Delete { id } => {
                    sqlx::query("DELETE FROM documents WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                }
            };
            response.items.push(BulkItemResult {
                id: op.id().to_string(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        tx.commit().await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct TestContext {
        store: SqliteDocumentStore,
        _dir: TempDir,
    }

    async fn create_test_context() -> TestContext {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("documents.db");
        let store = SqliteDocumentStore::from_path(&path).await.unwrap();
        TestContext { store, _dir: dir }
    }

    #[tokio::test]
    async fn test_index_get_and_overwrite() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        store
            .bulk(
                vec![BulkOperation::Index { id: "g.t".into(), source: json!({"state": "WAITING"}) }],
                Refresh::Immediate,
            )
            .await
            .unwrap();
        store
            .bulk(
                vec![BulkOperation::Index { id: "g.t".into(), source: json!({"state": "PAUSED"}) }],
                Refresh::Immediate,
            )
            .await
            .unwrap();

        let doc = store.get("g.t").await.unwrap().unwrap();
        assert_eq!(doc["state"], "PAUSED");
    }

    #[tokio::test]
    async fn test_delete_and_multi_get() {
        let ctx = create_test_context().await;
        let store = &ctx.store;

        let response = store
            .bulk(
                vec![
                    BulkOperation::Index { id: "a".into(), source: json!({"n": 1}) },
                    BulkOperation::Index { id: "b".into(), source: json!({"n": 2}) },
                    BulkOperation::Delete { id: "a".into() },
                    BulkOperation::Delete { id: "never-existed".into() },
                ],
                Refresh::Immediate,
            )
            .await
            .unwrap();
        assert!(!response.has_failures());

        let items = store.multi_get(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(items[0], MultiGetItem::Missing { id: "a".into() });
        assert_eq!(
            items[1],
            MultiGetItem::Found { id: "b".into(), source: json!({"n": 2}) }
        );
    }

    #[tokio::test]
    async fn test_reopen_keeps_documents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("documents.db");
        {
            let store = SqliteDocumentStore::from_path(&path).await.unwrap();
            store
                .bulk(
                    vec![BulkOperation::Index { id: "k".into(), source: json!([1, 2]) }],
                    Refresh::Immediate,
                )
                .await
                .unwrap();
        }
        let store = SqliteDocumentStore::from_path(&path).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!([1, 2])));
    }
}
