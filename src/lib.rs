pub mod cache;
pub mod config;
pub mod coordination;
pub mod database;
pub mod error;
pub mod idempotency;
pub mod permission;
pub mod pipeline;
pub mod store;
pub mod sync_bridge;
pub mod telemetry;

use crate::cache::{LruQueryCache, QueryCache};
use crate::config::{SyncConfig, validate_config};
use crate::error::PipelineError;
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::pipeline::{
    AuthorizationStage, Authorizer, CachingStage, DomainEventDispatcher, IdempotencyStage,
    LoggingStage, PermissionAuthorizer, Pipeline, PipelineBuilder, TransactionManager,
    TransactionStage, ValidationStage,
};
use std::sync::Arc;
use tracing::info;

pub use crate::coordination::{
    FlushHandler, NotificationDebouncer, RequestCoalescer, RequestVersionToken,
    VersionedResultGuard,
};
pub use crate::permission::{CallerContext, Permission};
pub use crate::pipeline::Dispatcher;
pub use crate::pipeline::envelope::{
    CacheDescriptor, DomainEvent, IdempotencyKey, Outcome, Rejection, RequestEnvelope,
    RequestKind,
};
pub use crate::store::{
    InvalidationRouter, LoadStatus, Reloadable, Store, StoreError, StoreOptions, StoreState,
    SubmitOutcome,
};

/// Collaborators of the standard stage set.
pub struct PipelineComponents {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub authorizer: Arc<dyn Authorizer>,
    pub validation: ValidationStage,
    pub cache: Arc<dyn QueryCache>,
    pub transactions: Arc<dyn TransactionManager>,
    pub events: Arc<dyn DomainEventDispatcher>,
}

impl PipelineComponents {
    /// Process-local idempotency store and cache, grant-based authorization
    /// and no validators.
    pub fn in_memory(
        config: &SyncConfig,
        transactions: Arc<dyn TransactionManager>,
        events: Arc<dyn DomainEventDispatcher>,
    ) -> Self {
        Self {
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            authorizer: Arc::new(PermissionAuthorizer),
            validation: ValidationStage::new(),
            cache: Arc::new(LruQueryCache::new(config.cache_capacity)),
            transactions,
            events,
        }
    }

    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = store;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_validation(mut self, validation: ValidationStage) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.cache = cache;
        self
    }
}

/// Builder preloaded with logging, idempotency, authorization, validation,
/// caching and transaction stages at their default priorities. Register
/// handlers on the result and call `build`.
pub fn standard_pipeline(
    config: &SyncConfig,
    components: PipelineComponents,
) -> Result<PipelineBuilder, PipelineError> {
    validate_config(config)?;
    info!(
        idempotency_ttl_secs = config.idempotency_ttl_secs,
        idempotency_wait_timeout_ms = config.idempotency_wait_timeout_ms,
        idempotency_claim_lease_ms = config.idempotency_claim_lease_ms,
        idempotency_failure_mode = ?config.idempotency_failure_mode,
        debounce_window_ms = config.debounce_window_ms,
        cache_capacity = config.cache_capacity,
        default_cache_ttl_secs = config.default_cache_ttl_secs,
        reload_after_submit = config.reload_after_submit,
        "building standard pipeline"
    );
    Ok(Pipeline::builder()
        .stage(LoggingStage::new())
        .stage(IdempotencyStage::new(components.idempotency, config))
        .stage(AuthorizationStage::new(components.authorizer))
        .stage(components.validation)
        .stage(CachingStage::new(components.cache, config))
        .stage(TransactionStage::new(
            components.transactions,
            components.events,
        )))
}
