use super::envelope::{Outcome, RequestEnvelope};
use super::{ExecutionContext, Next, Stage, StageKind, priority};
use crate::error::PipelineError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info_span, warn};

/// Outermost stage: one span per dispatch and a completion event carrying
/// latency. Dispatches slower than `slow_threshold` log at warn.
pub struct LoggingStage {
    slow_threshold: Duration,
    priority: i32,
}

impl Default for LoggingStage {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(500),
            priority: priority::LOGGING,
        }
    }
}

impl LoggingStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Stage for LoggingStage {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn kind(&self) -> StageKind {
        StageKind::Logging
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
        let span = info_span!(
            "dispatch",
            request_type = %envelope.request_type,
            kind = ?envelope.kind,
            tenant_id = %envelope.caller.tenant_id,
            depth = ctx.depth(),
        );
        let started = Instant::now();
        let result = next.run(ctx, envelope).instrument(span.clone()).await;
        let latency_micros = started.elapsed().as_micros() as u64;
        let slow = started.elapsed() >= self.slow_threshold;
        span.in_scope(|| match &result {
            Ok(Outcome::Success(_)) if slow => warn!(latency_micros, "slow dispatch"),
            Ok(Outcome::Success(_)) => debug!(latency_micros, "dispatch completed"),
            Ok(Outcome::Rejected(rejection)) => {
                debug!(latency_micros, code = %rejection.code, "dispatch rejected")
            }
            Err(err) => warn!(latency_micros, error = %err, code = err.code_str(), "dispatch failed"),
        });
        result
    }
}
