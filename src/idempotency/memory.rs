use super::{ClaimOutcome, IdempotencyRecord, IdempotencyStore, WaitOutcome, now_micros};
use crate::error::PipelineError;
use crate::pipeline::envelope::IdempotencyKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug)]
enum Slot {
    Pending {
        claimed_at: Instant,
        lease: Duration,
        // Dropped when the claim resolves; waiters observe the close.
        resolved: watch::Sender<()>,
    },
    Done(IdempotencyRecord),
}

impl Slot {
    fn is_stale(&self, now: Instant, now_micros: u64) -> bool {
        match self {
            Slot::Pending {
                claimed_at, lease, ..
            } => now.duration_since(*claimed_at) >= *lease,
            Slot::Done(record) => record.is_expired_at(now_micros),
        }
    }
}

/// Process-local idempotency store. Read-your-writes within the process.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    slots: Mutex<HashMap<IdempotencyKey, Slot>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, PipelineError> {
        let slots = self.slots.lock();
        Ok(match slots.get(key) {
            Some(Slot::Done(record)) if !record.is_expired() => Some(record.clone()),
            _ => None,
        })
    }

    async fn try_claim(
        &self,
        key: &IdempotencyKey,
        _command_type: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, PipelineError> {
        let now = Instant::now();
        let now_us = now_micros();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if !slot.is_stale(now, now_us) => match slot {
                Slot::Done(record) => return Ok(ClaimOutcome::Completed(record.clone())),
                Slot::Pending { .. } => return Ok(ClaimOutcome::InFlight),
            },
            _ => {}
        }
        let (resolved, _) = watch::channel(());
        slots.insert(
            key.clone(),
            Slot::Pending {
                claimed_at: now,
                lease,
                resolved,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete(&self, record: IdempotencyRecord) -> Result<(), PipelineError> {
        self.slots
            .lock()
            .insert(record.key.clone(), Slot::Done(record));
        Ok(())
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<(), PipelineError> {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Pending { .. })) {
            slots.remove(key);
        }
        Ok(())
    }

    async fn wait_for(
        &self,
        key: &IdempotencyKey,
        timeout: Duration,
    ) -> Result<WaitOutcome, PipelineError> {
        let (mut resolved, lease_left) = {
            let slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Pending {
                    resolved,
                    claimed_at,
                    lease,
                }) => (
                    resolved.subscribe(),
                    lease.saturating_sub(claimed_at.elapsed()),
                ),
                Some(Slot::Done(record)) if !record.is_expired() => {
                    return Ok(WaitOutcome::Completed(record.clone()));
                }
                _ => return Ok(WaitOutcome::Released),
            }
        };
        // No value is ever sent; `changed` returns once the sender is dropped.
        // A claim whose lease runs out first was abandoned and counts as released.
        if tokio::time::timeout(timeout.min(lease_left), resolved.changed())
            .await
            .is_err()
        {
            return Ok(if lease_left <= timeout {
                WaitOutcome::Released
            } else {
                WaitOutcome::TimedOut
            });
        }
        Ok(match self.get(key).await? {
            Some(record) => WaitOutcome::Completed(record),
            None => WaitOutcome::Released,
        })
    }

    async fn prune_expired(&self) -> Result<usize, PipelineError> {
        let now = Instant::now();
        let now_us = now_micros();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_stale(now, now_us));
        Ok(before - slots.len())
    }
}
