use super::envelope::{Outcome, RequestEnvelope};
use super::{ExecutionContext, Next, Stage, StageKind, priority};
use crate::cache::{CacheKey, QueryCache};
use crate::config::SyncConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Serves cacheable queries from a [`QueryCache`] and evicts them when a
/// command that names their request type succeeds.
///
/// Lookups are keyed by request type, tenant and user. A refreshing
/// descriptor skips the lookup and writes the new result over the entry.
/// Queries without both
/// a tenant and a user, or issued from inside an open transaction, bypass the
/// cache.
pub struct CachingStage {
    cache: Arc<dyn QueryCache>,
    default_ttl: Duration,
    priority: i32,
}

impl CachingStage {
    pub fn new(cache: Arc<dyn QueryCache>, config: &SyncConfig) -> Self {
        Self {
            cache,
            default_ttl: config.default_cache_ttl(),
            priority: priority::CACHING,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    async fn cached_query(
        &self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, PipelineError> {
        let Some(descriptor) = &envelope.cache else {
            return next.run(ctx, envelope).await;
        };
        if ctx.transaction().is_some() {
            return next.run(ctx, envelope).await;
        }
        let Some(key) = CacheKey::compose(&envelope.request_type, &envelope.caller, &descriptor.key)
        else {
            debug!(
                request_type = %envelope.request_type,
                "caller has no tenant or user; bypassing query cache"
            );
            return next.run(ctx, envelope).await;
        };

        if descriptor.refresh {
            debug!(key = %key, "refreshing cached query");
        } else if let Some(outcome) = self.cache.get(&key).await? {
            ctx.telemetry().record_cache_hit();
            debug!(key = %key, "query cache hit");
            return Ok(outcome);
        } else {
            ctx.telemetry().record_cache_miss();
        }

        let outcome = next.run(ctx, envelope).await?;
        if outcome.is_success() {
            let ttl = descriptor.ttl.unwrap_or(self.default_ttl);
            if let Err(err) = self.cache.insert(key.clone(), outcome.clone(), ttl).await {
                warn!(key = %key, error = %err, "failed to populate query cache");
            }
        }
        Ok(outcome)
    }

    async fn evict_after(&self, envelope: &RequestEnvelope, outcome: &Outcome) {
        if !outcome.is_success() || envelope.caller.tenant_id.is_empty() {
            return;
        }
        for request_type in &envelope.invalidates {
            let prefix = CacheKey::tenant_prefix(request_type, &envelope.caller.tenant_id);
            match self.cache.invalidate_prefix(&prefix).await {
                Ok(removed) => debug!(request_type = %request_type, removed, "evicted cached queries"),
                Err(err) => warn!(request_type = %request_type, error = %err, "cache eviction failed"),
            }
        }
    }
}

#[async_trait]
impl Stage for CachingStage {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn kind(&self) -> StageKind {
        StageKind::Caching
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
        if envelope.is_query() {
            return self.cached_query(ctx, envelope, next).await;
        }
        let outcome = next.run(ctx, envelope).await?;
        self.evict_after(envelope, &outcome).await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::CachingStage;
    use crate::cache::{LruQueryCache, QueryCache};
    use crate::config::SyncConfig;
    use crate::error::PipelineError;
    use crate::permission::{CallerContext, Permission};
    use crate::pipeline::envelope::{CacheDescriptor, Outcome, RequestEnvelope};
    use crate::pipeline::{
        AuthorizationStage, Dispatcher, ExecutionContext, Handler, PermissionAuthorizer, Pipeline,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Products(AtomicU32);

    #[async_trait]
    impl Handler for Products {
        async fn handle(
            &self,
            _ctx: &mut ExecutionContext,
            envelope: &RequestEnvelope,
            _pipeline: &Pipeline,
        ) -> Result<Outcome, PipelineError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            match envelope.payload.as_str() {
                Some("fail") => Err(PipelineError::handler("GetProductList", "db down")),
                Some("reject") => Ok(Outcome::rejected("not_found", "missing")),
                _ => Ok(Outcome::Success(json!({"tenant": envelope.caller.tenant_id, "n": n}))),
            }
        }
    }

    fn admin(tenant: &str, user: &str) -> CallerContext {
        CallerContext::new(tenant, user).with_grant(Permission::TenantAdmin {
            tenant_id: tenant.into(),
        })
    }

    fn setup() -> (Pipeline, Arc<LruQueryCache>, Arc<Products>) {
        let cache = Arc::new(LruQueryCache::new(64));
        let handler = Arc::new(Products::default());
        let pipeline = Pipeline::builder()
            .stage(AuthorizationStage::new(Arc::new(PermissionAuthorizer)))
            .stage(CachingStage::new(cache.clone(), &SyncConfig::default()))
            .handler_arc("GetProductList", handler.clone())
            .handler_arc("CreateProduct", handler.clone())
            .build()
            .expect("build");
        (pipeline, cache, handler)
    }

    fn query(caller: CallerContext, payload: &str) -> RequestEnvelope {
        RequestEnvelope::query("GetProductList", caller, json!(payload))
            .with_cache(CacheDescriptor::new(payload))
    }

    #[tokio::test]
    async fn repeated_query_is_served_from_cache() {
        let (pipeline, _, handler) = setup();
        let first = pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        let second = pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        let metrics = pipeline.metrics();
        assert_eq!((metrics.cache_hits, metrics.cache_misses), (1, 1));
    }

    #[tokio::test]
    async fn errors_and_rejections_are_not_cached() {
        let (pipeline, cache, _) = setup();
        pipeline
            .dispatch(query(admin("x", "u1"), "fail"))
            .await
            .expect_err("failure");
        pipeline.dispatch(query(admin("x", "u1"), "reject")).await.unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn denied_callers_never_reach_the_cache() {
        let (pipeline, cache, _) = setup();
        pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        let stranger = CallerContext::new("x", "u1");
        let err = pipeline.dispatch(query(stranger, "all")).await.expect_err("denied");
        assert_eq!(err.code_str(), "permission_denied");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn successful_command_evicts_tenant_entries() {
        let (pipeline, cache, handler) = setup();
        pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        pipeline.dispatch(query(admin("y", "u1"), "all")).await.unwrap();
        assert_eq!(cache.len(), 2);

        let create = RequestEnvelope::command("CreateProduct", admin("x", "u1"), json!("ok"))
            .invalidating("GetProductList");
        pipeline.dispatch(create).await.unwrap();
        assert_eq!(cache.len(), 1);

        pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn refresh_bypasses_lookup_and_replaces_entry() {
        let (pipeline, cache, handler) = setup();
        let first = pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        assert_eq!(first, Outcome::Success(json!({"tenant": "x", "n": 1})));

        let refreshed = pipeline
            .dispatch(
                RequestEnvelope::query("GetProductList", admin("x", "u1"), json!("all"))
                    .with_cache(CacheDescriptor::new("all").refreshing()),
            )
            .await
            .unwrap();
        assert_eq!(refreshed, Outcome::Success(json!({"tenant": "x", "n": 2})));
        assert_eq!(cache.len(), 1);

        let cached = pipeline.dispatch(query(admin("x", "u1"), "all")).await.unwrap();
        assert_eq!(cached, refreshed);
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
        let metrics = pipeline.metrics();
        assert_eq!((metrics.cache_hits, metrics.cache_misses), (1, 1));
    }
}
