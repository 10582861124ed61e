pub mod memory;

use crate::error::PipelineError;
use crate::pipeline::envelope::{IdempotencyKey, Outcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use memory::InMemoryIdempotencyStore;

/// Stored outcome of the first successful execution of a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub command_type: String,
    /// MessagePack-encoded [`Outcome`].
    pub result: Vec<u8>,
    pub created_at_micros: u64,
    pub expires_at_micros: u64,
}

impl IdempotencyRecord {
    pub fn new(
        key: IdempotencyKey,
        command_type: impl Into<String>,
        outcome: &Outcome,
        ttl: Duration,
    ) -> Result<Self, PipelineError> {
        let created_at_micros = now_micros();
        Ok(Self {
            key,
            command_type: command_type.into(),
            result: outcome.encode()?,
            created_at_micros,
            expires_at_micros: created_at_micros.saturating_add(ttl.as_micros() as u64),
        })
    }

    pub fn is_expired_at(&self, now_micros: u64) -> bool {
        now_micros >= self.expires_at_micros
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_micros())
    }

    pub fn outcome(&self) -> Result<Outcome, PipelineError> {
        Outcome::decode(&self.result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the key and must either `complete` or `release` it.
    Claimed,
    /// An unexpired record exists; replay it.
    Completed(IdempotencyRecord),
    /// Another attempt holds the claim.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(IdempotencyRecord),
    /// The other attempt gave up its claim without a record.
    Released,
    TimedOut,
}

/// Key-value store of idempotency records with an atomic claim step.
///
/// `try_claim` is the check-then-set primitive: at most one caller sees
/// `Claimed` for a key until that caller completes or releases it, or its
/// lease runs out. Stores that cannot provide this give a best-effort
/// guarantee only.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, PipelineError>;

    async fn try_claim(
        &self,
        key: &IdempotencyKey,
        command_type: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, PipelineError>;

    async fn complete(&self, record: IdempotencyRecord) -> Result<(), PipelineError>;

    async fn release(&self, key: &IdempotencyKey) -> Result<(), PipelineError>;

    /// Polls `get` until a record shows up. Stores with change notification
    /// should override this; polling cannot observe a release and reports
    /// `TimedOut` instead.
    async fn wait_for(
        &self,
        key: &IdempotencyKey,
        timeout: Duration,
    ) -> Result<WaitOutcome, PipelineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(5);
        loop {
            if let Some(record) = self.get(key).await? {
                return Ok(WaitOutcome::Completed(record));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(Duration::from_millis(200));
        }
    }

    async fn prune_expired(&self) -> Result<usize, PipelineError>;
}

/// Periodically removes expired records and abandoned claims.
pub fn spawn_sweeper(store: Arc<dyn IdempotencyStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.prune_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "idempotency sweep"),
                Err(err) => warn!(error = %err, "idempotency sweep failed"),
            }
        }
    })
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::{IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore, spawn_sweeper};
    use crate::pipeline::envelope::{IdempotencyKey, Outcome};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn record_expiry_is_inclusive_of_deadline() {
        let record = IdempotencyRecord::new(
            IdempotencyKey::new("k"),
            "CreateOrder",
            &Outcome::Success(json!(1)),
            Duration::from_secs(10),
        )
        .expect("record");
        assert!(!record.is_expired_at(record.created_at_micros));
        assert!(record.is_expired_at(record.expires_at_micros));
        assert_eq!(
            record.outcome().expect("decode"),
            Outcome::Success(json!(1))
        );
    }

    #[tokio::test]
    async fn sweeper_removes_expired_records() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let record = IdempotencyRecord::new(
            IdempotencyKey::new("old"),
            "CreateOrder",
            &Outcome::Success(json!(null)),
            Duration::from_millis(1),
        )
        .expect("record");
        store.complete(record).await.expect("complete");
        assert_eq!(store.len(), 1);

        let handle = spawn_sweeper(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();
        assert_eq!(store.len(), 0);
    }
}
