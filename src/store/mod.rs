pub mod router;

use crate::config::SyncConfig;
use crate::coordination::{RequestCoalescer, RequestVersionToken, VersionedResultGuard};
use crate::error::PipelineError;
use crate::permission::CallerContext;
use crate::pipeline::Dispatcher;
use crate::pipeline::envelope::{
    CacheDescriptor, IdempotencyKey, Outcome, Rejection, RequestEnvelope,
};
use crate::telemetry::PipelineTelemetry;
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub use router::InvalidationRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Idle,
    Loading,
    Loaded,
    Errored,
}

/// UI-facing projection of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreError {
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&PipelineError> for StoreError {
    fn from(err: &PipelineError) -> Self {
        Self::new(err.code_str(), err.to_string())
    }
}

impl From<Rejection> for StoreError {
    fn from(rejection: Rejection) -> Self {
        Self::new(rejection.code, rejection.message)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Snapshot of a store. `data` survives a failed reload.
#[derive(Debug)]
pub struct StoreState<T> {
    pub status: LoadStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<StoreError>,
    /// Bumped on every applied load result.
    pub revision: u64,
    pub params: Option<Value>,
}

impl<T> Clone for StoreState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            revision: self.revision,
            params: self.params.clone(),
        }
    }
}

impl<T> Default for StoreState<T> {
    fn default() -> Self {
        Self {
            status: LoadStatus::Idle,
            data: None,
            error: None,
            revision: 0,
            params: None,
        }
    }
}

impl<T> StoreState<T> {
    pub fn is_loading(&self) -> bool {
        self.status == LoadStatus::Loading
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Succeeded(Value),
    Rejected(Rejection),
    Failed(StoreError),
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Succeeded(_))
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Names the resource for versioning and invalidation routing.
    pub logical_key: String,
    pub query_type: String,
    pub caller: CallerContext,
    /// Query results are cacheable for this long when set.
    pub cache_ttl: Option<Duration>,
    pub reload_after_submit: bool,
    pub telemetry: Option<Arc<PipelineTelemetry>>,
}

impl StoreOptions {
    pub fn new(
        logical_key: impl Into<String>,
        query_type: impl Into<String>,
        caller: CallerContext,
    ) -> Self {
        Self {
            logical_key: logical_key.into(),
            query_type: query_type.into(),
            caller,
            cache_ttl: None,
            reload_after_submit: true,
            telemetry: None,
        }
    }

    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.reload_after_submit = config.reload_after_submit;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_reload_after_submit(mut self, enabled: bool) -> Self {
        self.reload_after_submit = enabled;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Something the invalidation router can refresh.
#[async_trait]
pub trait Reloadable: Send + Sync {
    fn logical_key(&self) -> &str;
    async fn reload(&self);
}

/// State container for one logical resource.
///
/// Loads with identical params share one dispatch. Every load is stamped
/// with a version token and its result is applied only if no newer load
/// started meanwhile. Failures become state; nothing here returns an error
/// to UI code.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StoreInner<T> {
    options: StoreOptions,
    dispatcher: Arc<dyn Dispatcher>,
    coalescer: RequestCoalescer<String, StoreState<T>>,
    guard: VersionedResultGuard,
    state: watch::Sender<StoreState<T>>,
    telemetry: Arc<PipelineTelemetry>,
}

impl<T> Store<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(dispatcher: Arc<dyn Dispatcher>, options: StoreOptions) -> Self {
        let telemetry = options.telemetry.clone().unwrap_or_default();
        let (state, _) = watch::channel(StoreState::default());
        Self {
            inner: Arc::new(StoreInner {
                coalescer: RequestCoalescer::new().with_telemetry(Arc::clone(&telemetry)),
                options,
                dispatcher,
                guard: VersionedResultGuard::new(),
                state,
                telemetry,
            }),
        }
    }

    pub fn logical_key(&self) -> &str {
        &self.inner.options.logical_key
    }

    pub fn state(&self) -> StoreState<T> {
        self.inner.state.borrow().clone()
    }

    /// Notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<StoreState<T>> {
        self.inner.state.subscribe()
    }

    pub async fn load(&self, params: Value) -> StoreState<T> {
        self.fetch(params, false).await
    }

    /// Re-runs the last load with fresh data; any older in-flight load for
    /// the same params becomes stale. Without a previous load this is a no-op.
    pub async fn reload(&self) -> StoreState<T> {
        let params = self.inner.state.borrow().params.clone();
        match params {
            Some(params) => self.fetch(params, true).await,
            None => self.state(),
        }
    }

    /// Drops data and makes every in-flight load stale.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.state.send_modify(|state| {
            inner.guard.issue(&inner.options.logical_key);
            *state = StoreState::default();
        });
    }

    pub async fn submit(
        &self,
        command_type: &str,
        payload: Value,
        idempotency_key: Option<IdempotencyKey>,
    ) -> SubmitOutcome {
        let inner = &self.inner;
        let mut envelope =
            RequestEnvelope::command(command_type, inner.options.caller.clone(), payload)
                .invalidating(inner.options.query_type.clone());
        if let Some(key) = idempotency_key {
            envelope = envelope.with_idempotency_key(key);
        }
        let outcome = match inner.dispatch(envelope).await {
            Ok(Outcome::Success(value)) => SubmitOutcome::Succeeded(value),
            Ok(Outcome::Rejected(rejection)) => SubmitOutcome::Rejected(rejection),
            Err(err) => {
                debug!(command_type, error = %err, "submit failed");
                SubmitOutcome::Failed(StoreError::from(&err))
            }
        };
        if outcome.is_success() && inner.options.reload_after_submit {
            self.reload().await;
        }
        outcome
    }

    async fn fetch(&self, params: Value, fresh: bool) -> StoreState<T> {
        let key = format!("{}:{}", self.inner.options.logical_key, params);
        let inner = Arc::clone(&self.inner);
        // A flight stamped before the latest reset or load can only produce a
        // stale result, so it is never joined.
        let joinable = |sequence: u64| {
            !fresh && sequence == self.inner.guard.current(&self.inner.options.logical_key)
        };
        let result = self
            .inner
            .coalescer
            .coalesce_if(key, joinable, move || inner.start_flight(params, fresh))
            .await;
        match result {
            Ok(state) => state,
            Err(err) => {
                warn!(key = %self.inner.options.logical_key, error = %err, "load flight failed");
                self.state()
            }
        }
    }
}

impl<T> StoreInner<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Runs on the flight leader: stamps the load and marks it in progress
    /// under the state lock, then returns the stamp and the work to spawn.
    fn start_flight(
        self: Arc<Self>,
        params: Value,
        fresh: bool,
    ) -> (
        u64,
        impl Future<Output = Result<StoreState<T>, PipelineError>> + Send + 'static,
    ) {
        let mut token = None;
        self.state.send_modify(|state| {
            token = Some(self.guard.issue(&self.options.logical_key));
            state.status = LoadStatus::Loading;
            state.params = Some(params.clone());
        });
        let sequence = token.as_ref().map_or(0, |token| token.sequence);
        let work = async move {
            let envelope = self.query_envelope(params, fresh);
            let loaded = match self.dispatch(envelope).await {
                Ok(Outcome::Success(value)) => serde_json::from_value::<T>(value)
                    .map_err(|err| StoreError::from(&PipelineError::from(err))),
                Ok(Outcome::Rejected(rejection)) => Err(StoreError::from(rejection)),
                Err(err) => Err(StoreError::from(&err)),
            };
            Ok(match token {
                Some(token) => self.apply(&token, loaded),
                None => self.state.borrow().clone(),
            })
        };
        (sequence, work)
    }

    /// A fresh load skips the cached entry but still replaces it, so a later
    /// plain load never returns data older than the reload.
    fn query_envelope(&self, params: Value, fresh: bool) -> RequestEnvelope {
        let cache = self.options.cache_ttl.map(|ttl| {
            let descriptor = CacheDescriptor::new(params.to_string()).with_ttl(ttl);
            if fresh { descriptor.refreshing() } else { descriptor }
        });
        let mut envelope =
            RequestEnvelope::query(&self.options.query_type, self.options.caller.clone(), params);
        envelope.cache = cache;
        envelope
    }

    async fn dispatch(&self, envelope: RequestEnvelope) -> Result<Outcome, PipelineError> {
        match AssertUnwindSafe(self.dispatcher.dispatch(envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Internal("dispatcher panicked".into())),
        }
    }

    fn apply(
        &self,
        token: &RequestVersionToken,
        loaded: Result<T, StoreError>,
    ) -> StoreState<T> {
        let applied = self.state.send_if_modified(|state| {
            if !self.guard.should_apply(token) {
                return false;
            }
            match loaded {
                Ok(data) => {
                    state.status = LoadStatus::Loaded;
                    state.data = Some(Arc::new(data));
                    state.error = None;
                }
                Err(error) => {
                    state.status = LoadStatus::Errored;
                    state.error = Some(error);
                }
            }
            state.revision += 1;
            true
        });
        if !applied {
            self.telemetry.record_stale_drop();
            debug!(
                key = %self.options.logical_key,
                sequence = token.sequence,
                "dropping stale load result"
            );
        }
        self.state.borrow().clone()
    }
}

#[async_trait]
impl<T> Reloadable for Store<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn logical_key(&self) -> &str {
        &self.inner.options.logical_key
    }

    async fn reload(&self) {
        Store::reload(self).await;
    }
}
