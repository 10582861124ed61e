use crate::error::PipelineError;
use crate::telemetry::PipelineTelemetry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

type SharedFlight<T> = Shared<BoxFuture<'static, Result<T, PipelineError>>>;

struct Flight<T: Clone> {
    id: u64,
    /// Caller-supplied tag, checked by `coalesce_if` before joining.
    generation: u64,
    result: SharedFlight<T>,
}

type FlightMap<K, T> = Arc<Mutex<HashMap<K, Flight<T>>>>;

/// Removes a flight's entry when its task finishes or unwinds, unless a
/// newer flight has replaced it.
struct Deregister<K: Eq + Hash, T: Clone> {
    flights: FlightMap<K, T>,
    key: Option<K>,
    id: u64,
}

impl<K: Eq + Hash, T: Clone> Drop for Deregister<K, T> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut flights = self.flights.lock();
        if flights.get(&key).is_some_and(|flight| flight.id == self.id) {
            flights.remove(&key);
        }
    }
}

/// Single-flight execution keyed by `K`.
///
/// Concurrent callers for the same key share one spawned execution and all
/// observe its result, including its error. The execution keeps running when
/// every caller goes away.
pub struct RequestCoalescer<K, T: Clone> {
    flights: FlightMap<K, T>,
    next_id: AtomicU64,
    telemetry: Arc<PipelineTelemetry>,
}

impl<K, T> Default for RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            telemetry: Arc::new(PipelineTelemetry::default()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Joins the in-flight execution for `key`, or starts one with
    /// `factory`. `factory` runs synchronously under the registration lock,
    /// only for the caller that starts the flight.
    pub async fn coalesce<F, Fut>(&self, key: K, factory: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        self.coalesce_if(key, |_| true, || (0, factory())).await
    }

    /// Like [`coalesce`](Self::coalesce), but joins the in-flight execution
    /// only when `joinable` accepts the generation it was started with.
    /// Otherwise `factory` starts a replacement tagged with the generation
    /// it returns.
    pub async fn coalesce_if<J, F, Fut>(
        &self,
        key: K,
        joinable: J,
        factory: F,
    ) -> Result<T, PipelineError>
    where
        J: FnOnce(u64) -> bool,
        F: FnOnce() -> (u64, Fut),
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let flight = {
            let mut flights = self.flights.lock();
            let joined = flights
                .get(&key)
                .filter(|existing| joinable(existing.generation))
                .map(|existing| existing.result.clone());
            match joined {
                Some(result) => {
                    self.record_join();
                    result
                }
                None => {
                    let (generation, fut) = factory();
                    self.start(&mut flights, key, generation, fut)
                }
            }
        };
        flight.await
    }

    /// Always starts a new execution and makes it the one later callers join.
    /// A replaced flight still completes for whoever awaits it.
    pub async fn supersede<F, Fut>(&self, key: K, factory: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        self.coalesce_if(key, |_| false, || (0, factory())).await
    }

    fn start<Fut>(
        &self,
        flights: &mut HashMap<K, Flight<T>>,
        key: K,
        generation: u64,
        fut: Fut,
    ) -> SharedFlight<T>
    where
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Deregister {
            flights: Arc::clone(&self.flights),
            key: Some(key.clone()),
            id,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            fut.await
        });
        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(PipelineError::Internal(format!(
                    "coalesced request did not complete: {err}"
                ))),
            }
        }
        .boxed()
        .shared();
        flights.insert(
            key,
            Flight {
                id,
                generation,
                result: result.clone(),
            },
        );
        result
    }

    fn record_join(&self) {
        self.telemetry.record_coalesced_join();
        debug!("joined in-flight request");
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.lock().contains_key(key)
    }

    pub fn in_flight_len(&self) -> usize {
        self.flights.lock().len()
    }

    /// Callers that joined an existing flight instead of starting one, as
    /// counted by the attached telemetry.
    pub fn joins(&self) -> u64 {
        self.telemetry.snapshot().coalesced_joins
    }
}
