use super::envelope::{DomainEvent, Outcome, RequestEnvelope};
use super::{ExecutionContext, Next, Stage, StageKind, priority};
use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event handlers may raise further events; this bounds the cascade.
pub const MAX_EVENT_ROUNDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<TransactionId, PipelineError>;
    /// Flushes pending writes into the open transaction.
    async fn save_changes(&self, tx: TransactionId) -> Result<(), PipelineError>;
    async fn commit(&self, tx: TransactionId) -> Result<(), PipelineError>;
    async fn rollback(&self, tx: TransactionId) -> Result<(), PipelineError>;
}

/// Publishes deferred events inside the still-open transaction.
#[async_trait]
pub trait DomainEventDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        events: Vec<DomainEvent>,
    ) -> Result<(), PipelineError>;
}

/// Wraps a command in one unit of work.
///
/// Commit happens only for `Outcome::Success` and only after every deferred
/// event has been dispatched and changes saved. Any failure on that path, a
/// rejection or a handler error rolls back. A command dispatched while a
/// transaction is already open joins it instead of nesting.
pub struct TransactionStage {
    manager: Arc<dyn TransactionManager>,
    events: Arc<dyn DomainEventDispatcher>,
    priority: i32,
}

impl TransactionStage {
    pub fn new(
        manager: Arc<dyn TransactionManager>,
        events: Arc<dyn DomainEventDispatcher>,
    ) -> Self {
        Self {
            manager,
            events,
            priority: priority::TRANSACTION,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    async fn publish_deferred(&self, ctx: &mut ExecutionContext) -> Result<(), PipelineError> {
        for _ in 0..MAX_EVENT_ROUNDS {
            let events = ctx.take_events();
            if events.is_empty() {
                return Ok(());
            }
            self.events.dispatch(ctx, events).await?;
        }
        if ctx.pending_events() == 0 {
            return Ok(());
        }
        Err(PipelineError::EventDispatch {
            message: format!("domain events still pending after {MAX_EVENT_ROUNDS} rounds"),
        })
    }

    async fn finish(&self, ctx: &mut ExecutionContext, tx: TransactionId) -> Result<(), PipelineError> {
        self.publish_deferred(ctx).await?;
        self.manager.save_changes(tx).await?;
        self.manager.commit(tx).await
    }

    async fn abort(&self, ctx: &mut ExecutionContext, tx: TransactionId, reason: &str) {
        let discarded = ctx.discard_events();
        for completion in ctx.take_completions() {
            completion.abandon().await;
        }
        ctx.telemetry().record_rollback();
        if let Err(err) = self.manager.rollback(tx).await {
            warn!(%tx, error = %err, reason, "rollback failed");
        } else {
            debug!(%tx, discarded, reason, "transaction rolled back");
        }
    }
}

#[async_trait]
impl Stage for TransactionStage {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn kind(&self) -> StageKind {
        StageKind::Transaction
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
        if !envelope.is_command() || ctx.transaction().is_some() {
            return next.run(ctx, envelope).await;
        }

        let tx = self.manager.begin().await?;
        ctx.set_transaction(Some(tx));
        let result = next.run(ctx, envelope).await;
        let result = match result {
            Ok(Outcome::Success(value)) => match self.finish(ctx, tx).await {
                Ok(()) => {
                    ctx.telemetry().record_commit();
                    // Nested keyed commands are remembered only once their writes are durable.
                    for completion in ctx.take_completions() {
                        completion.commit().await;
                    }
                    Ok(Outcome::Success(value))
                }
                Err(err) => {
                    self.abort(ctx, tx, "commit path failed").await;
                    Err(err)
                }
            },
            Ok(rejected @ Outcome::Rejected(_)) => {
                self.abort(ctx, tx, "rejected").await;
                Ok(rejected)
            }
            Err(err) => {
                self.abort(ctx, tx, "handler failed").await;
                Err(err)
            }
        };
        ctx.set_transaction(None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{DomainEventDispatcher, TransactionId, TransactionManager, TransactionStage};
    use crate::error::PipelineError;
    use crate::permission::CallerContext;
    use crate::pipeline::envelope::{DomainEvent, Outcome, RequestEnvelope};
    use crate::pipeline::{Dispatcher, ExecutionContext, Handler, Pipeline};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::Arc;

    #[derive(Default)]
    struct Journal {
        log: Mutex<Vec<String>>,
        fail_rollback: bool,
    }

    #[async_trait]
    impl TransactionManager for Journal {
        async fn begin(&self) -> Result<TransactionId, PipelineError> {
            let mut log = self.log.lock();
            log.push("begin".into());
            Ok(TransactionId(log.len() as u64))
        }
        async fn save_changes(&self, _tx: TransactionId) -> Result<(), PipelineError> {
            self.log.lock().push("save".into());
            Ok(())
        }
        async fn commit(&self, _tx: TransactionId) -> Result<(), PipelineError> {
            self.log.lock().push("commit".into());
            Ok(())
        }
        async fn rollback(&self, _tx: TransactionId) -> Result<(), PipelineError> {
            self.log.lock().push("rollback".into());
            if self.fail_rollback {
                return Err(PipelineError::Transaction {
                    message: "connection lost".into(),
                });
            }
            Ok(())
        }
    }

    struct Events(Arc<Journal>);

    #[async_trait]
    impl DomainEventDispatcher for Events {
        async fn dispatch(
            &self,
            ctx: &mut ExecutionContext,
            events: Vec<DomainEvent>,
        ) -> Result<(), PipelineError> {
            for event in events {
                self.0.log.lock().push(format!("event:{}", event.name));
                if event.name == "loop" {
                    ctx.raise(DomainEvent::new("loop", Value::Null));
                }
            }
            Ok(())
        }
    }

    struct Scripted;

    #[async_trait]
    impl Handler for Scripted {
        async fn handle(
            &self,
            ctx: &mut ExecutionContext,
            envelope: &RequestEnvelope,
            pipeline: &Pipeline,
        ) -> Result<Outcome, PipelineError> {
            match envelope.payload.as_str() {
                Some("reject") => {
                    ctx.raise(DomainEvent::new("never", Value::Null));
                    Ok(Outcome::rejected("conflict", "nope"))
                }
                Some("fail") => Err(PipelineError::handler("Write", "boom")),
                Some("loop") => {
                    ctx.raise(DomainEvent::new("loop", Value::Null));
                    Ok(Outcome::Success(Value::Null))
                }
                Some("nested") => {
                    let inner = RequestEnvelope::command("Write", envelope.caller.clone(), json!("ok"));
                    pipeline.dispatch_within(ctx, &inner).await
                }
                _ => {
                    ctx.raise(DomainEvent::new("written", Value::Null));
                    Ok(Outcome::Success(json!(ctx.transaction().map(|tx| tx.0))))
                }
            }
        }
    }

    fn build(journal: Arc<Journal>) -> Pipeline {
        Pipeline::builder()
            .stage(TransactionStage::new(
                journal.clone(),
                Arc::new(Events(journal)),
            ))
            .handler("Write", Scripted)
            .handler("Read", Scripted)
            .build()
            .expect("build")
    }

    fn command(payload: &str) -> RequestEnvelope {
        RequestEnvelope::command("Write", CallerContext::new("t1", "u1"), json!(payload))
    }

    #[tokio::test]
    async fn success_publishes_events_before_commit() {
        let journal = Arc::new(Journal::default());
        let pipeline = build(journal.clone());
        let outcome = pipeline.dispatch(command("ok")).await.expect("dispatch");
        assert_eq!(outcome, Outcome::Success(json!(1)));
        assert_eq!(
            *journal.log.lock(),
            vec!["begin", "event:written", "save", "commit"]
        );
        assert_eq!(pipeline.metrics().commits, 1);
    }

    #[tokio::test]
    async fn rejection_rolls_back_and_drops_events() {
        let journal = Arc::new(Journal::default());
        let pipeline = build(journal.clone());
        let outcome = pipeline.dispatch(command("reject")).await.expect("dispatch");
        assert!(!outcome.is_success());
        assert_eq!(*journal.log.lock(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn original_error_wins_over_rollback_failure() {
        let journal = Arc::new(Journal {
            fail_rollback: true,
            ..Journal::default()
        });
        let pipeline = build(journal.clone());
        let err = pipeline.dispatch(command("fail")).await.expect_err("failure");
        assert_eq!(err.code_str(), "handler");
        assert_eq!(pipeline.metrics().rollbacks, 1);
    }

    #[tokio::test]
    async fn nested_command_joins_outer_transaction() {
        let journal = Arc::new(Journal::default());
        let pipeline = build(journal.clone());
        let outcome = pipeline.dispatch(command("nested")).await.expect("dispatch");
        assert_eq!(outcome, Outcome::Success(json!(1)));
        let log = journal.log.lock();
        assert_eq!(log.iter().filter(|entry| *entry == "begin").count(), 1);
        assert_eq!(log.iter().filter(|entry| *entry == "commit").count(), 1);
    }

    #[tokio::test]
    async fn queries_do_not_open_transactions() {
        let journal = Arc::new(Journal::default());
        let pipeline = build(journal.clone());
        let outcome = pipeline
            .dispatch(RequestEnvelope::query("Read", CallerContext::new("t1", "u1"), json!("ok")))
            .await
            .expect("dispatch");
        assert_eq!(outcome, Outcome::Success(Value::Null));
        assert!(journal.log.lock().is_empty());
    }

    #[tokio::test]
    async fn runaway_event_cascade_rolls_back() {
        let journal = Arc::new(Journal::default());
        let pipeline = build(journal.clone());
        let err = pipeline.dispatch(command("loop")).await.expect_err("cascade");
        assert_eq!(err.code_str(), "event_dispatch");
        assert_eq!(journal.log.lock().last().map(String::as_str), Some("rollback"));
    }
}
