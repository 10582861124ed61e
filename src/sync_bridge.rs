use crate::pipeline::envelope::IdempotencyKey;
use crate::store::{Store, StoreState, SubmitOutcome};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use tokio::runtime::Handle;

/// Blocks on `f`. Inside a multi-threaded runtime this uses
/// `block_in_place`; calling it from a current-thread runtime panics.
pub fn block_on_store<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

/// Blocking facade over a [`Store`] for UI threads that are not async.
pub struct StoreSync<T> {
    inner: Store<T>,
    rt: Handle,
}

impl<T> StoreSync<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(inner: Store<T>, rt: Handle) -> Self {
        Self { inner, rt }
    }

    pub fn load(&self, params: Value) -> StoreState<T> {
        block_on_store(&self.rt, self.inner.load(params))
    }

    pub fn reload(&self) -> StoreState<T> {
        block_on_store(&self.rt, self.inner.reload())
    }

    pub fn submit(
        &self,
        command_type: &str,
        payload: Value,
        idempotency_key: Option<IdempotencyKey>,
    ) -> SubmitOutcome {
        block_on_store(
            &self.rt,
            self.inner.submit(command_type, payload, idempotency_key),
        )
    }

    pub fn state(&self) -> StoreState<T> {
        self.inner.state()
    }

    pub fn store(&self) -> &Store<T> {
        &self.inner
    }
}
