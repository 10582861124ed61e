use super::envelope::{Outcome, RequestEnvelope, RequestKind};
use super::{ExecutionContext, Next, Stage, StageKind, priority};
use crate::error::PipelineError;
use crate::permission::{Access, CallerContext};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        caller: &CallerContext,
        envelope: &RequestEnvelope,
    ) -> Result<(), PipelineError>;
}

/// Checks the caller's own grants: queries need read access to the request
/// type, commands need write access. Internal system callers always pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionAuthorizer;

#[async_trait]
impl Authorizer for PermissionAuthorizer {
    async fn authorize(
        &self,
        caller: &CallerContext,
        envelope: &RequestEnvelope,
    ) -> Result<(), PipelineError> {
        if caller.is_internal_system() {
            return Ok(());
        }
        if caller.is_anonymous() {
            return Err(PipelineError::PermissionDenied(format!(
                "anonymous caller may not invoke '{}'",
                envelope.request_type
            )));
        }
        let access = match envelope.kind {
            RequestKind::Query => Access::Read,
            RequestKind::Command => Access::Write,
        };
        if caller.can(&envelope.request_type, access) {
            Ok(())
        } else {
            Err(PipelineError::PermissionDenied(format!(
                "user '{}' lacks {:?} access to '{}' in tenant '{}'",
                caller.user_id, access, envelope.request_type, caller.tenant_id
            )))
        }
    }
}

pub struct AuthorizationStage {
    authorizer: Arc<dyn Authorizer>,
    priority: i32,
}

impl AuthorizationStage {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            authorizer,
            priority: priority::AUTHORIZATION,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Stage for AuthorizationStage {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn kind(&self) -> StageKind {
        StageKind::Authorization
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
        self.authorizer.authorize(&envelope.caller, envelope).await?;
        next.run(ctx, envelope).await
    }
}
