use super::ExecutionContext;
use super::envelope::DomainEvent;
use super::transaction::DomainEventDispatcher;
use crate::error::PipelineError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        event: &DomainEvent,
    ) -> Result<(), PipelineError>;
}

/// Routes deferred events by name to every subscribed handler, in
/// subscription order. Events nobody subscribed to are dropped.
#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_name.into())
            .or_default()
            .push(handler);
    }

    pub fn unsubscribe(&self, event_name: &str, handler: &Arc<dyn EventHandler>) {
        if let Some(handlers) = self.handlers.write().get_mut(event_name) {
            handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
        }
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.handlers.read().get(event_name).map_or(0, Vec::len)
    }
}

#[async_trait]
impl DomainEventDispatcher for EventHandlerRegistry {
    async fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        events: Vec<DomainEvent>,
    ) -> Result<(), PipelineError> {
        for event in events {
            let handlers = self.handlers.read().get(&event.name).cloned();
            let Some(handlers) = handlers else {
                debug!(event = %event.name, "no subscribers for domain event");
                continue;
            };
            for handler in handlers {
                handler
                    .handle(ctx, &event)
                    .await
                    .map_err(|err| PipelineError::EventDispatch {
                        message: format!("handler for '{}' failed: {err}", event.name),
                    })?;
            }
        }
        Ok(())
    }
}
