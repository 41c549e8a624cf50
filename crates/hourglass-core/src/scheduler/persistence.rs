//! Asynchronous persistence of trigger state
//!
//! Mutations mark triggers dirty; a flush drains the whole dirty set into
//! one batch and hands it to a single writer task. Batches are written in
//! submission order. Items that fail are marked dirty again and go out with
//! a later flush.

use dashmap::DashSet;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::keys::TriggerKey;
use crate::documents::{BulkOperation, DocumentStore, Refresh};

/// Triggers whose persisted state is stale
pub type DirtySet = Arc<DashSet<TriggerKey>>;

/// Pending write for one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerWrite {
    /// Store the document
    Index(TriggerKey, Value),
    /// Remove the document
    Delete(TriggerKey),
}

impl TriggerWrite {
    fn key(&self) -> &TriggerKey {
        match self {
            Self::Index(key, _) | Self::Delete(key) => key,
        }
    }
}

enum WriterMessage {
    Batch(Vec<TriggerWrite>),
    Sync(oneshot::Sender<()>),
}

/// Single-consumer writer of trigger documents
pub struct PersistenceWriter {
    dirty: DirtySet,
    sender: Mutex<Option<mpsc::UnboundedSender<WriterMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWriter {
    /// Spawn the writer task
    pub fn start(documents: Arc<dyn DocumentStore>, doc_id_prefix: Option<String>) -> Arc<Self> {
        let dirty: DirtySet = Arc::new(DashSet::new());
        let (sender, mut receiver) = mpsc::unbounded_channel::<WriterMessage>();

        let task_dirty = dirty.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    WriterMessage::Batch(batch) => {
                        write_batch(documents.as_ref(), doc_id_prefix.as_deref(), &task_dirty, batch)
                            .await;
                    }
                    WriterMessage::Sync(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Trigger state writer stopped");
        });

        Arc::new(Self {
            dirty,
            sender: Mutex::new(Some(sender)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Mark one trigger dirty
    pub fn mark_dirty(&self, key: &TriggerKey) {
        self.dirty.insert(key.clone());
    }

    /// Whether a trigger is waiting to be written
    pub fn is_dirty(&self, key: &TriggerKey) -> bool {
        self.dirty.contains(key)
    }

    /// Number of dirty triggers
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Take every dirty key
    pub fn drain_dirty(&self) -> Vec<TriggerKey> {
        let keys: Vec<TriggerKey> = self.dirty.iter().map(|k| k.clone()).collect();
        for key in &keys {
            self.dirty.remove(key);
        }
        keys
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<WriterMessage>> {
        match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("Trigger writer lock poisoned: {}", e);
                None
            }
        }
    }

    /// Queue a batch for the writer task; never waits for the write
    pub fn submit(&self, batch: Vec<TriggerWrite>) {
        if batch.is_empty() {
            return;
        }
        let Some(sender) = self.sender() else {
            warn!("Trigger writer is stopped; keeping {} triggers dirty", batch.len());
            self.remark(&batch);
            return;
        };
        if let Err(mpsc::error::SendError(WriterMessage::Batch(batch))) =
            sender.send(WriterMessage::Batch(batch))
        {
            warn!("Trigger writer is gone; keeping {} triggers dirty", batch.len());
            self.remark(&batch);
        }
    }

    /// Wait until every batch submitted so far has been written
    pub async fn sync(&self) {
        let Some(sender) = self.sender() else {
            return;
        };
        let (done, written) = oneshot::channel();
        if sender.send(WriterMessage::Sync(done)).is_ok() {
            let _ = written.await;
        }
    }

    fn remark(&self, batch: &[TriggerWrite]) {
        for write in batch {
            self.dirty.insert(write.key().clone());
        }
    }

    /// Stop accepting batches and wait for queued ones
    ///
    /// Returns false when the writer had to be aborted after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut task) = task else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Trigger writer did not finish within {:?}; aborting", timeout);
                task.abort();
                false
            }
        }
    }
}

async fn write_batch(
    documents: &dyn DocumentStore,
    prefix: Option<&str>,
    dirty: &DashSet<TriggerKey>,
    batch: Vec<TriggerWrite>,
) {
    let mut by_id: HashMap<String, TriggerKey> = HashMap::with_capacity(batch.len());
    let operations: Vec<BulkOperation> = batch
        .into_iter()
        .map(|write| {
            let id = write.key().document_id(prefix);
            by_id.insert(id.clone(), write.key().clone());
            match write {
                TriggerWrite::Index(_, source) => BulkOperation::Index { id, source },
                TriggerWrite::Delete(_) => BulkOperation::Delete { id },
            }
        })
        .collect();

    debug!("Writing {} trigger documents", operations.len());
    match documents.bulk(operations, Refresh::Immediate).await {
        Ok(response) => {
            for item in response.failures() {
                error!(
                    "Error while writing trigger state {}: {}",
                    item.id,
                    item.error.as_deref().unwrap_or("unknown")
                );
                if let Some(key) = by_id.get(&item.id) {
                    dirty.insert(key.clone());
                }
            }
        }
        Err(e) => {
            error!("Error while writing {} trigger states: {}", by_id.len(), e);
            for key in by_id.into_values() {
                dirty.insert(key);
            }
        }
    }
}
