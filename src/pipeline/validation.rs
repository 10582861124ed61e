use super::envelope::{Outcome, Rejection, RequestEnvelope};
use super::{ExecutionContext, Next, Stage, StageKind, priority};
use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const VALIDATION_FAILED: &str = "validation_failed";

/// Returns human readable violations; an empty list means valid.
pub trait Validator: Send + Sync {
    fn validate(&self, envelope: &RequestEnvelope) -> Vec<String>;
}

impl<F> Validator for F
where
    F: Fn(&RequestEnvelope) -> Vec<String> + Send + Sync,
{
    fn validate(&self, envelope: &RequestEnvelope) -> Vec<String> {
        self(envelope)
    }
}

/// Rejects requests with violations before they reach caching, the
/// transaction or the handler.
pub struct ValidationStage {
    validators: HashMap<String, Vec<Arc<dyn Validator>>>,
    priority: i32,
}

impl Default for ValidationStage {
    fn default() -> Self {
        Self {
            validators: HashMap::new(),
            priority: priority::VALIDATION,
        }
    }
}

impl ValidationStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validator(
        mut self,
        request_type: impl Into<String>,
        validator: impl Validator + 'static,
    ) -> Self {
        self.validators
            .entry(request_type.into())
            .or_default()
            .push(Arc::new(validator));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn violations(&self, envelope: &RequestEnvelope) -> Vec<String> {
        self.validators
            .get(&envelope.request_type)
            .into_iter()
            .flatten()
            .flat_map(|validator| validator.validate(envelope))
            .collect()
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn kind(&self) -> StageKind {
        StageKind::Validation
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
        let violations = self.violations(envelope);
        if violations.is_empty() {
            return next.run(ctx, envelope).await;
        }
        debug!(
            request_type = %envelope.request_type,
            violations = violations.len(),
            "request failed validation"
        );
        Ok(Outcome::Rejected(
            Rejection::new(
                VALIDATION_FAILED,
                format!("'{}' failed validation", envelope.request_type),
            )
            .with_details(violations),
        ))
    }
}
