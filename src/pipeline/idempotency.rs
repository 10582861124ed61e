use super::envelope::{IdempotencyKey, Outcome, RequestEnvelope};
use super::{ExecutionContext, Next, Stage, StageKind, priority};
use crate::cache::escape_segment;
use crate::config::{IdempotencyFailureMode, SyncConfig};
use crate::error::PipelineError;
use crate::idempotency::{ClaimOutcome, IdempotencyRecord, IdempotencyStore, WaitOutcome};
use crate::permission::CallerContext;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// An owned claim on an idempotency key.
///
/// Dropping an unsettled claim, for example when the dispatch future is
/// cancelled mid-handler, releases it on a spawned task so the next attempt
/// with the same key can run.
pub(crate) struct ClaimGuard {
    store: Arc<dyn IdempotencyStore>,
    key: IdempotencyKey,
    armed: bool,
}

impl ClaimGuard {
    fn new(store: Arc<dyn IdempotencyStore>, key: IdempotencyKey) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    async fn complete(mut self, record: IdempotencyRecord) {
        match self.store.complete(record).await {
            Ok(()) => self.armed = false,
            Err(err) => {
                warn!(key = %self.key, error = %err, "failed to store idempotency record");
                self.release().await;
            }
        }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(err) = self.store.release(&self.key).await {
            warn!(key = %self.key, error = %err, "failed to release idempotency claim");
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        match Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "releasing claim of an abandoned attempt");
                handle.spawn(async move {
                    if let Err(err) = store.release(&key).await {
                        warn!(key = %key, error = %err, "failed to release abandoned claim");
                    }
                });
            }
            Err(_) => warn!(key = %key, "no runtime to release abandoned claim; it expires with its lease"),
        }
    }
}

impl fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("key", &self.key)
            .field("armed", &self.armed)
            .finish()
    }
}

/// Record of a command that succeeded inside an enclosing transaction. It is
/// stored only once that transaction commits.
#[derive(Debug)]
pub(crate) struct PendingCompletion {
    claim: ClaimGuard,
    record: IdempotencyRecord,
}

impl PendingCompletion {
    pub(crate) async fn commit(self) {
        self.claim.complete(self.record).await;
    }

    pub(crate) async fn abandon(self) {
        self.claim.release().await;
    }
}

enum Admission {
    /// This attempt owns the key.
    Execute,
    Replay(IdempotencyRecord),
    /// Store unreachable and the stage fails open.
    Unguarded,
}

/// Runs a keyed command at most once per key and replays its first
/// successful outcome.
///
/// Keys are scoped to the caller's tenant and user, so one principal can
/// never replay another's result with a guessed key.
pub struct IdempotencyStage {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    wait_timeout: Duration,
    lease: Duration,
    failure_mode: IdempotencyFailureMode,
    priority: i32,
}

impl IdempotencyStage {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            ttl: config.idempotency_ttl(),
            wait_timeout: config.idempotency_wait_timeout(),
            lease: config.idempotency_claim_lease(),
            failure_mode: config.idempotency_failure_mode,
            priority: priority::IDEMPOTENCY,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scoped_key(caller: &CallerContext, key: &IdempotencyKey) -> IdempotencyKey {
        IdempotencyKey(format!(
            "{}:{}:{}",
            escape_segment(&caller.tenant_id),
            escape_segment(&caller.user_id),
            key.as_str()
        ))
    }

    async fn admit(
        &self,
        key: &IdempotencyKey,
        command_type: &str,
    ) -> Result<Admission, PipelineError> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let claim = match self.store.try_claim(key, command_type, self.lease).await {
                Ok(claim) => claim,
                Err(err) => return self.on_store_failure(key, err),
            };
            match claim {
                ClaimOutcome::Claimed => return Ok(Admission::Execute),
                ClaimOutcome::Completed(record) => return Ok(Admission::Replay(record)),
                ClaimOutcome::InFlight => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PipelineError::Timeout);
            }
            debug!(key = %key, "waiting for in-flight attempt");
            match self.store.wait_for(key, remaining).await {
                Ok(WaitOutcome::Completed(record)) => return Ok(Admission::Replay(record)),
                Ok(WaitOutcome::Released) => continue,
                Ok(WaitOutcome::TimedOut) => return Err(PipelineError::Timeout),
                Err(err) => return self.on_store_failure(key, err),
            }
        }
    }

    fn on_store_failure(
        &self,
        key: &IdempotencyKey,
        err: PipelineError,
    ) -> Result<Admission, PipelineError> {
        match self.failure_mode {
            IdempotencyFailureMode::FailClosed => Err(PipelineError::IdempotencyUnavailable {
                message: err.to_string(),
            }),
            IdempotencyFailureMode::FailOpen => {
                warn!(key = %key, error = %err, "idempotency store unavailable; executing without dedup");
                Ok(Admission::Unguarded)
            }
        }
    }

    fn replay(
        &self,
        ctx: &ExecutionContext,
        record: &IdempotencyRecord,
        command_type: &str,
    ) -> Result<Outcome, PipelineError> {
        if record.command_type != command_type {
            return Err(PipelineError::Validation(format!(
                "idempotency key was already used for '{}'",
                record.command_type
            )));
        }
        let outcome = record.outcome()?;
        ctx.telemetry().record_replay();
        debug!(key = %record.key, command_type, "replaying stored outcome");
        Ok(outcome)
    }

    async fn settle(
        &self,
        ctx: &mut ExecutionContext,
        claim: ClaimGuard,
        command_type: &str,
        result: &Result<Outcome, PipelineError>,
    ) {
        let Ok(outcome @ Outcome::Success(_)) = result else {
            claim.release().await;
            return;
        };
        let record = match IdempotencyRecord::new(claim.key().clone(), command_type, outcome, self.ttl)
        {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %claim.key(), error = %err, "failed to encode idempotency record");
                claim.release().await;
                return;
            }
        };
        if ctx.transaction().is_some() {
            debug!(key = %record.key, "holding idempotency record until the enclosing transaction commits");
            ctx.defer_completion(PendingCompletion { claim, record });
            return;
        }
        claim.complete(record).await;
    }
}

#[async_trait]
impl Stage for IdempotencyStage {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    fn kind(&self) -> StageKind {
        StageKind::Idempotency
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, PipelineError> {
        let key = match &envelope.idempotency_key {
            Some(key) if envelope.is_command() => Self::scoped_key(&envelope.caller, key),
            _ => return next.run(ctx, envelope).await,
        };
        match self.admit(&key, &envelope.request_type).await? {
            Admission::Replay(record) => self.replay(ctx, &record, &envelope.request_type),
            Admission::Unguarded => next.run(ctx, envelope).await,
            Admission::Execute => {
                let claim = ClaimGuard::new(Arc::clone(&self.store), key);
                let result = next.run(ctx, envelope).await;
                self.settle(ctx, claim, &envelope.request_type, &result).await;
                result
            }
        }
    }
}
