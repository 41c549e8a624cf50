//! Durable document store
//!
//! Trigger state is persisted one document per trigger, addressed by the
//! trigger's escaped identity. Backends only need point reads, multi-get
//! and bulk index/delete.

mod memory;
mod sqlite;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Visibility guarantee requested for a bulk write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Refresh {
    /// Visible whenever the backend gets to it
    #[default]
    None,
    /// Visible to reads issued after the call returns
    Immediate,
}

/// One operation of a bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Create or overwrite a document
    Index {
        /// Document id
        id: String,
        /// Document body
        source: Value,
    },
    /// Delete a document; missing documents are not an error
    Delete {
        /// Document id
        id: String,
    },
}

impl BulkOperation {
    /// Target document id
    pub fn id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Delete { id } => id,
        }
    }
}

/// Outcome of one bulk item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    /// Document id
    pub id: String,
    /// Failure reason, if the item failed
    pub error: Option<String>,
}

/// Outcome of a bulk write
#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    /// Per-item outcomes, in request order
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Whether any item failed
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|item| item.error.is_some())
    }

    /// Failed items
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|item| item.error.is_some())
    }
}

/// Outcome of one multi-get item
#[derive(Debug, Clone, PartialEq)]
pub enum MultiGetItem {
    /// Document exists
    Found {
        /// Document id
        id: String,
        /// Document body
        source: Value,
    },
    /// No such document
    Missing {
        /// Document id
        id: String,
    },
    /// The read failed for this id
    Failed {
        /// Document id
        id: String,
        /// Failure reason
        reason: String,
    },
}

impl MultiGetItem {
    /// Requested document id
    pub fn id(&self) -> &str {
        match self {
            Self::Found { id, .. } | Self::Missing { id } | Self::Failed { id, .. } => id,
        }
    }
}

/// Document backend for persisted trigger state
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document
    async fn get(&self, id: &str) -> Result<Option<Value>>;

    /// Read several documents; one item per requested id
    async fn multi_get(&self, ids: &[String]) -> Result<Vec<MultiGetItem>>;

    /// Apply index and delete operations, reporting each item
    async fn bulk(&self, operations: Vec<BulkOperation>, refresh: Refresh) -> Result<BulkResponse>;
}
