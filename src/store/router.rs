use super::Reloadable;
use crate::coordination::FlushHandler;
use crate::telemetry::PipelineTelemetry;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Fans a debounced flush out to the registered stores.
///
/// Each store whose logical key is in the flushed set reloads once per flush;
/// the reloads run concurrently.
#[derive(Default)]
pub struct InvalidationRouter {
    stores: RwLock<Vec<Arc<dyn Reloadable>>>,
    telemetry: Option<Arc<PipelineTelemetry>>,
}

impl InvalidationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_telemetry(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn register(&self, store: Arc<dyn Reloadable>) {
        self.stores.write().push(store);
    }

    pub fn unregister(&self, store: &Arc<dyn Reloadable>) {
        self.stores
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, store));
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }
}

#[async_trait]
impl FlushHandler for InvalidationRouter {
    async fn on_flush(&self, keys: BTreeSet<String>) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_flush();
        }
        let affected: Vec<Arc<dyn Reloadable>> = self
            .stores
            .read()
            .iter()
            .filter(|store| keys.contains(store.logical_key()))
            .cloned()
            .collect();
        debug!(keys = keys.len(), stores = affected.len(), "routing invalidations");
        join_all(affected.iter().map(|store| store.reload())).await;
    }
}
