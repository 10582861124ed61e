pub mod authorization;
pub mod caching;
pub mod envelope;
pub mod events;
pub mod idempotency;
pub mod logging;
pub mod transaction;
pub mod validation;

use crate::error::PipelineError;
use crate::permission::CallerContext;
use crate::telemetry::{
    DispatchTelemetryEvent, DispatchTelemetryHook, PipelineMetrics, PipelineTelemetry,
};
use async_trait::async_trait;
use envelope::{DomainEvent, Outcome, RequestEnvelope};
use idempotency::PendingCompletion;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use transaction::TransactionId;

pub use authorization::{AuthorizationStage, Authorizer, PermissionAuthorizer};
pub use caching::CachingStage;
pub use events::{EventHandler, EventHandlerRegistry};
pub use idempotency::IdempotencyStage;
pub use logging::LoggingStage;
pub use transaction::{DomainEventDispatcher, TransactionManager, TransactionStage};
pub use validation::{ValidationStage, Validator};

/// Default priorities. Lower runs first (outermost).
pub mod priority {
    pub const LOGGING: i32 = 0;
    pub const IDEMPOTENCY: i32 = 100;
    pub const AUTHORIZATION: i32 = 200;
    pub const VALIDATION: i32 = 300;
    pub const CACHING: i32 = 400;
    pub const TRANSACTION: i32 = 500;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Logging,
    Idempotency,
    Authorization,
    Validation,
    Caching,
    Transaction,
    Custom,
}

/// Per-dispatch state shared by every stage and the handler.
///
/// One context spans a top-level dispatch and every nested dispatch a
/// handler issues through [`Pipeline::dispatch_within`], so a nested command
/// joins the outer transaction and its events are published with it.
#[derive(Debug)]
pub struct ExecutionContext {
    caller: CallerContext,
    transaction: Option<TransactionId>,
    deferred_events: Vec<DomainEvent>,
    pending_completions: Vec<PendingCompletion>,
    telemetry: Arc<PipelineTelemetry>,
    depth: u32,
}

impl ExecutionContext {
    pub fn new(caller: CallerContext, telemetry: Arc<PipelineTelemetry>) -> Self {
        Self {
            caller,
            transaction: None,
            deferred_events: Vec::new(),
            pending_completions: Vec::new(),
            telemetry,
            depth: 0,
        }
    }

    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn set_transaction(&mut self, tx: Option<TransactionId>) {
        self.transaction = tx;
    }

    /// Defers an event until the surrounding transaction commits.
    pub fn raise(&mut self, event: DomainEvent) {
        self.deferred_events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.deferred_events)
    }

    pub fn discard_events(&mut self) -> usize {
        let dropped = self.deferred_events.len();
        self.deferred_events.clear();
        dropped
    }

    pub fn pending_events(&self) -> usize {
        self.deferred_events.len()
    }

    pub(crate) fn defer_completion(&mut self, completion: PendingCompletion) {
        self.pending_completions.push(completion);
    }

    pub(crate) fn take_completions(&mut self) -> Vec<PendingCompletion> {
        std::mem::take(&mut self.pending_completions)
    }

    pub fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    /// Number of dispatches currently on the stack; 1 for a top-level call.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.depth > 1
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StageKind;
    fn priority(&self) -> i32;

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, PipelineError>;
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// `pipeline` is the dispatching pipeline; nested requests go through
    /// [`Pipeline::dispatch_within`] with the same `ctx`.
    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
        pipeline: &Pipeline,
    ) -> Result<Outcome, PipelineError>;
}

/// Remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    handler: &'a dyn Handler,
    pipeline: &'a Pipeline,
}

impl<'a> Next<'a> {
    pub async fn run(
        self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
    ) -> Result<Outcome, PipelineError> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    handler: self.handler,
                    pipeline: self.pipeline,
                };
                stage.execute(ctx, envelope, next).await
            }
            None => self.handler.handle(ctx, envelope, self.pipeline).await,
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, envelope: RequestEnvelope) -> Result<Outcome, PipelineError>;
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    telemetry: Arc<PipelineTelemetry>,
    telemetry_hooks: Mutex<Vec<Arc<dyn DispatchTelemetryHook>>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Runs `envelope` through the whole chain inside an existing context.
    pub async fn dispatch_within(
        &self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
    ) -> Result<Outcome, PipelineError> {
        let started = Instant::now();
        let result = match self.handlers.get(&envelope.request_type) {
            Some(handler) => {
                ctx.depth += 1;
                let next = Next {
                    stages: &self.stages,
                    handler: handler.as_ref(),
                    pipeline: self,
                };
                let result = next.run(ctx, envelope).await;
                ctx.depth -= 1;
                result
            }
            None => Err(PipelineError::HandlerNotFound {
                request_type: envelope.request_type.clone(),
            }),
        };
        self.emit_dispatch_telemetry(started, envelope, &result);
        result
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn has_handler(&self, request_type: &str) -> bool {
        self.handlers.contains_key(request_type)
    }

    pub fn telemetry(&self) -> Arc<PipelineTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.telemetry.snapshot()
    }

    pub fn add_telemetry_hook(&self, hook: Arc<dyn DispatchTelemetryHook>) {
        self.telemetry_hooks.lock().push(hook);
    }

    pub fn remove_telemetry_hook(&self, hook: &Arc<dyn DispatchTelemetryHook>) {
        let mut hooks = self.telemetry_hooks.lock();
        hooks.retain(|existing| !Arc::ptr_eq(existing, hook));
    }

    fn emit_dispatch_telemetry(
        &self,
        started: Instant,
        envelope: &RequestEnvelope,
        result: &Result<Outcome, PipelineError>,
    ) {
        let latency_micros = started.elapsed().as_micros() as u64;
        let (ok, rejected, error) = match result {
            Ok(Outcome::Success(_)) => (true, false, None),
            Ok(Outcome::Rejected(_)) => (true, true, None),
            Err(err) => (false, false, Some(err.to_string())),
        };
        self.telemetry.record_dispatch(latency_micros, ok, rejected);
        let hooks = self.telemetry_hooks.lock().clone();
        if hooks.is_empty() {
            return;
        }
        let event = DispatchTelemetryEvent {
            request_type: envelope.request_type.clone(),
            kind: envelope.kind,
            tenant_id: envelope.caller.tenant_id.clone(),
            latency_micros,
            ok,
            rejected,
            error,
        };
        for hook in hooks {
            hook.on_dispatch(&event);
        }
    }
}

#[async_trait]
impl Dispatcher for Pipeline {
    async fn dispatch(&self, envelope: RequestEnvelope) -> Result<Outcome, PipelineError> {
        let mut ctx = ExecutionContext::new(envelope.caller.clone(), Arc::clone(&self.telemetry));
        self.dispatch_within(&mut ctx, &envelope).await
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    telemetry: Option<Arc<PipelineTelemetry>>,
}

impl PipelineBuilder {
    pub fn stage(self, stage: impl Stage + 'static) -> Self {
        self.stage_arc(Arc::new(stage))
    }

    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn handler(self, request_type: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handler_arc(request_type, Arc::new(handler))
    }

    pub fn handler_arc(mut self, request_type: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(request_type.into(), handler);
        self
    }

    /// Shares counters with stores or another pipeline.
    pub fn telemetry(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(mut self) -> Result<Pipeline, PipelineError> {
        self.stages.sort_by_key(|stage| stage.priority());
        check_stage_order(&self.stages)?;
        Ok(Pipeline {
            stages: self.stages,
            handlers: self.handlers,
            telemetry: self.telemetry.unwrap_or_default(),
            telemetry_hooks: Mutex::new(Vec::new()),
        })
    }
}

/// `stages` must already be sorted by priority.
fn check_stage_order(stages: &[Arc<dyn Stage>]) -> Result<(), PipelineError> {
    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage.priority()) {
            return Err(PipelineError::InvalidConfig {
                message: format!(
                    "stage '{}' shares priority {} with another stage",
                    stage.name(),
                    stage.priority()
                ),
            });
        }
    }

    let position = |kind: StageKind| stages.iter().position(|stage| stage.kind() == kind);
    if let (Some(idempotency), Some(transaction)) = (
        stages
            .iter()
            .rposition(|stage| stage.kind() == StageKind::Idempotency),
        position(StageKind::Transaction),
    ) && idempotency > transaction
    {
        return Err(PipelineError::InvalidConfig {
            message: "idempotency stage must run before the transaction stage".into(),
        });
    }
    if let Some(caching) = position(StageKind::Caching) {
        match position(StageKind::Authorization) {
            Some(authorization) if authorization < caching => {}
            _ => {
                return Err(PipelineError::InvalidConfig {
                    message: "caching stage must run after an authorization stage".into(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        ExecutionContext, Handler, Next, Pipeline, Stage, StageKind, priority,
    };
    use crate::error::PipelineError;
    use crate::permission::CallerContext;
    use crate::pipeline::Dispatcher;
    use crate::pipeline::envelope::{Outcome, RequestEnvelope};
    use crate::telemetry::{DispatchTelemetryEvent, DispatchTelemetryHook};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct Marker {
        name: &'static str,
        kind: StageKind,
        priority: i32,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Stage for Marker {
        fn name(&self) -> &'static str {
            self.name
        }
        fn kind(&self) -> StageKind {
            self.kind
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
            self.trace.lock().push(self.name);
            next.run(ctx, envelope).await
        }
    }

    fn marker(
        name: &'static str,
        kind: StageKind,
        priority: i32,
        trace: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Marker {
        Marker {
            name,
            kind,
            priority,
            trace: Arc::clone(trace),
        }
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(
            &self,
            ctx: &mut ExecutionContext,
            envelope: &RequestEnvelope,
            _pipeline: &Pipeline,
        ) -> Result<Outcome, PipelineError> {
            Ok(Outcome::Success(json!({
                "payload": envelope.payload,
                "depth": ctx.depth(),
            })))
        }
    }

    struct Outer;

    #[async_trait]
    impl Handler for Outer {
        async fn handle(
            &self,
            ctx: &mut ExecutionContext,
            envelope: &RequestEnvelope,
            pipeline: &Pipeline,
        ) -> Result<Outcome, PipelineError> {
            let inner =
                RequestEnvelope::query("Echo", envelope.caller.clone(), Value::String("in".into()));
            pipeline.dispatch_within(ctx, &inner).await
        }
    }

    fn caller() -> CallerContext {
        CallerContext::new("t1", "u1")
    }

    #[tokio::test]
    async fn stages_run_in_priority_order_regardless_of_registration() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .stage(marker("tx", StageKind::Transaction, priority::TRANSACTION, &trace))
            .stage(marker("log", StageKind::Logging, priority::LOGGING, &trace))
            .stage(marker("idem", StageKind::Idempotency, priority::IDEMPOTENCY, &trace))
            .handler("Echo", Echo)
            .build()
            .expect("build");
        assert_eq!(pipeline.stage_names(), vec!["log", "idem", "tx"]);

        pipeline
            .dispatch(RequestEnvelope::query("Echo", caller(), json!(1)))
            .await
            .expect("dispatch");
        assert_eq!(*trace.lock(), vec!["log", "idem", "tx"]);
    }

    #[test]
    fn idempotency_after_transaction_is_rejected() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let err = Pipeline::builder()
            .stage(marker("tx", StageKind::Transaction, 10, &trace))
            .stage(marker("idem", StageKind::Idempotency, 20, &trace))
            .build()
            .err()
            .expect("misordered pipeline");
        assert_eq!(err.code_str(), "invalid_config");
    }

    #[test]
    fn caching_requires_prior_authorization() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let missing = Pipeline::builder()
            .stage(marker("cache", StageKind::Caching, priority::CACHING, &trace))
            .build();
        assert!(matches!(missing, Err(PipelineError::InvalidConfig { .. })));

        let late = Pipeline::builder()
            .stage(marker("cache", StageKind::Caching, 10, &trace))
            .stage(marker("auth", StageKind::Authorization, 20, &trace))
            .build();
        assert!(matches!(late, Err(PipelineError::InvalidConfig { .. })));
    }

    #[test]
    fn duplicate_priorities_are_rejected() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let result = Pipeline::builder()
            .stage(marker("a", StageKind::Custom, 7, &trace))
            .stage(marker("b", StageKind::Custom, 7, &trace))
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn unknown_request_type_is_handler_not_found() {
        let pipeline = Pipeline::builder().build().expect("build");
        let err = pipeline
            .dispatch(RequestEnvelope::command("Nope", caller(), Value::Null))
            .await
            .expect_err("no handler");
        assert_eq!(
            err,
            PipelineError::HandlerNotFound {
                request_type: "Nope".into()
            }
        );
        assert_eq!(pipeline.metrics().dispatch_errors, 1);
    }

    #[tokio::test]
    async fn nested_dispatch_reuses_the_context() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .stage(marker("log", StageKind::Logging, priority::LOGGING, &trace))
            .handler("Echo", Echo)
            .handler("Outer", Outer)
            .build()
            .expect("build");
        let outcome = pipeline
            .dispatch(RequestEnvelope::command("Outer", caller(), Value::Null))
            .await
            .expect("dispatch");
        assert_eq!(outcome, Outcome::Success(json!({"payload": "in", "depth": 2})));
        assert_eq!(trace.lock().len(), 2);
        assert_eq!(pipeline.metrics().dispatches_total, 2);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DispatchTelemetryEvent>>);

    impl DispatchTelemetryHook for Recorder {
        fn on_dispatch(&self, event: &DispatchTelemetryEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[tokio::test]
    async fn telemetry_hooks_can_be_removed() {
        let pipeline = Pipeline::builder().handler("Echo", Echo).build().expect("build");
        let recorder = Arc::new(Recorder::default());
        let hook: Arc<dyn DispatchTelemetryHook> = recorder.clone();
        pipeline.add_telemetry_hook(Arc::clone(&hook));

        pipeline
            .dispatch(RequestEnvelope::query("Echo", caller(), json!(1)))
            .await
            .expect("dispatch");
        pipeline.remove_telemetry_hook(&hook);
        pipeline
            .dispatch(RequestEnvelope::query("Echo", caller(), json!(2)))
            .await
            .expect("dispatch");

        let events = recorder.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_type, "Echo");
        assert_eq!(events[0].tenant_id, "t1");
        assert!(events[0].ok);
    }
}
