//! In-memory document store
//!
//! Used by single-process deployments and tests. Failures can be injected
//! per document id or for whole bulk calls.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{BulkItemResult, BulkOperation, BulkResponse, DocumentStore, MultiGetItem, Refresh};
use crate::error::{Result, StoreError};

/// Document store backed by a map
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Value>>,
    failing_ids: RwLock<HashSet<String>>,
    fail_bulk: AtomicBool,
    bulk_calls: AtomicUsize,
}

impl MemoryDocumentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document directly
    pub async fn put(&self, id: impl Into<String>, source: Value) {
        self.documents.write().await.insert(id.into(), source);
    }

    /// Number of stored documents
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Make reads and writes of one id fail
    pub async fn fail_id(&self, id: impl Into<String>) {
        self.failing_ids.write().await.insert(id.into());
    }

    /// Stop failing one id
    pub async fn heal_id(&self, id: &str) {
        self.failing_ids.write().await.remove(id);
    }

    /// Make every bulk call fail as a whole
    pub fn fail_bulk(&self, fail: bool) {
        self.fail_bulk.store(fail, Ordering::SeqCst);
    }

    /// Number of bulk calls received
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        if self.failing_ids.read().await.contains(id) {
            return Err(StoreError::Document(format!("read of {} failed", id)));
        }
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn multi_get(&self, ids: &[String]) -> Result<Vec<MultiGetItem>> {
        let failing = self.failing_ids.read().await;
        let documents = self.documents.read().await;
        Ok(ids
            .iter()
            .map(|id| {
                if failing.contains(id) {
                    MultiGetItem::Failed {
                        id: id.clone(),
                        reason: "injected read failure".to_string(),
                    }
                } else {
                    match documents.get(id) {
                        Some(source) => MultiGetItem::Found {
                            id: id.clone(),
                            source: source.clone(),
                        },
                        None => MultiGetItem::Missing { id: id.clone() },
                    }
                }
            })
            .collect())
    }

    async fn bulk(&self, operations: Vec<BulkOperation>, _refresh: Refresh) -> Result<BulkResponse> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(StoreError::Document("bulk request rejected".to_string()));
        }

        let failing = self.failing_ids.read().await;
        let mut documents = self.documents.write().await;
        let mut response = BulkResponse::default();
        for op in operations {
            let id = op.id().to_string();
            if failing.contains(&id) {
                response.items.push(BulkItemResult {
                    id,
                    error: Some("injected write failure".to_string()),
                });
                continue;
            }
            match op {
                BulkOperation::Index { id, source } => {
                    documents.insert(id, source);
                }
                BulkOperation::Delete { id } => {
                    documents.remove(&id);
                }
            }
            response.items.push(BulkItemResult { id, error: None });
        }
        Ok(response)
    }
}
