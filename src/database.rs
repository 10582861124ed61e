use crate::error::PipelineError;
use crate::pipeline::ExecutionContext;
use crate::pipeline::transaction::{TransactionId, TransactionManager};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// `None` marks a delete.
type WriteSet = BTreeMap<String, Option<Value>>;

#[derive(Debug, Default)]
struct OpenTransaction {
    pending: WriteSet,
    saved: WriteSet,
}

/// In-memory key-value database with per-transaction staging.
///
/// Writes made through a context with an open transaction are pending until
/// `save_changes`, and invisible to other readers until `commit`. Without a
/// transaction they apply immediately.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    committed: RwLock<BTreeMap<String, Value>>,
    open: Mutex<HashMap<TransactionId, OpenTransaction>>,
    next_tx: AtomicU64,
    commit_seq: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        ctx: &ExecutionContext,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), PipelineError> {
        self.write(ctx, key.into(), Some(value))
    }

    pub fn delete(&self, ctx: &ExecutionContext, key: impl Into<String>) -> Result<(), PipelineError> {
        self.write(ctx, key.into(), None)
    }

    fn write(
        &self,
        ctx: &ExecutionContext,
        key: String,
        value: Option<Value>,
    ) -> Result<(), PipelineError> {
        let Some(tx) = ctx.transaction() else {
            let mut committed = self.committed.write();
            match value {
                Some(value) => committed.insert(key, value),
                None => committed.remove(&key),
            };
            self.commit_seq.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        let mut open = self.open.lock();
        let staged = open.get_mut(&tx).ok_or_else(|| unknown_transaction(tx))?;
        staged.pending.insert(key, value);
        Ok(())
    }

    /// Committed value only.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.committed.read().get(key).cloned()
    }

    /// Reads through the context's open transaction, if any.
    pub fn get_in(&self, ctx: &ExecutionContext, key: &str) -> Option<Value> {
        if let Some(tx) = ctx.transaction()
            && let Some(staged) = self.open.lock().get(&tx)
        {
            if let Some(value) = staged.pending.get(key).or_else(|| staged.saved.get(key)) {
                return value.clone();
            }
        }
        self.get(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.committed.read().clone()
    }

    pub fn open_transactions(&self) -> usize {
        self.open.lock().len()
    }

    /// Number of committed write batches.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::Relaxed)
    }
}

fn unknown_transaction(tx: TransactionId) -> PipelineError {
    PipelineError::Transaction {
        message: format!("{tx} is not open"),
    }
}

#[async_trait]
impl TransactionManager for MemoryDatabase {
    async fn begin(&self) -> Result<TransactionId, PipelineError> {
        let tx = TransactionId(self.next_tx.fetch_add(1, Ordering::Relaxed) + 1);
        self.open.lock().insert(tx, OpenTransaction::default());
        Ok(tx)
    }

    async fn save_changes(&self, tx: TransactionId) -> Result<(), PipelineError> {
        let mut open = self.open.lock();
        let staged = open.get_mut(&tx).ok_or_else(|| unknown_transaction(tx))?;
        let pending = std::mem::take(&mut staged.pending);
        staged.saved.extend(pending);
        Ok(())
    }

    async fn commit(&self, tx: TransactionId) -> Result<(), PipelineError> {
        let staged = self
            .open
            .lock()
            .remove(&tx)
            .ok_or_else(|| unknown_transaction(tx))?;
        if !staged.pending.is_empty() {
            debug!(%tx, unsaved = staged.pending.len(), "discarding unsaved writes at commit");
        }
        let mut committed = self.committed.write();
        for (key, value) in staged.saved {
            match value {
                Some(value) => committed.insert(key, value),
                None => committed.remove(&key),
            };
        }
        self.commit_seq.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<(), PipelineError> {
        self.open
            .lock()
            .remove(&tx)
            .map(|_| ())
            .ok_or_else(|| unknown_transaction(tx))
    }
}
