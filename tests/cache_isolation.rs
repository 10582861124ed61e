use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use storesync::database::MemoryDatabase;
use storesync::error::PipelineError;
use storesync::pipeline::{EventHandlerRegistry, ExecutionContext, Handler, Pipeline};
use storesync::{
    CacheDescriptor, CallerContext, Dispatcher, Outcome, Permission, PipelineComponents,
    RequestEnvelope, config::SyncConfig, standard_pipeline,
};

/// Lists the products stored under the caller's tenant.
struct ListProducts {
    db: Arc<MemoryDatabase>,
    calls: AtomicU32,
}

#[async_trait]
impl Handler for ListProducts {
    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        _envelope: &RequestEnvelope,
        _pipeline: &Pipeline,
    ) -> Result<Outcome, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}/products", ctx.caller().tenant_id);
        Outcome::success(&self.db.get(&key).unwrap_or_else(|| json!([])))
    }
}

struct AddProduct {
    db: Arc<MemoryDatabase>,
}

#[async_trait]
impl Handler for AddProduct {
    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        envelope: &RequestEnvelope,
        _pipeline: &Pipeline,
    ) -> Result<Outcome, PipelineError> {
        let key = format!("{}/products", ctx.caller().tenant_id);
        let mut products = match self.db.get_in(ctx, &key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        products.push(envelope.payload["name"].clone());
        self.db.put(ctx, key, Value::Array(products))?;
        Outcome::success(&json!({"added": true}))
    }
}

fn seeded_db() -> Arc<MemoryDatabase> {
    let db = Arc::new(MemoryDatabase::new());
    let ctx = ExecutionContext::new(
        CallerContext::system("seed"),
        Arc::new(storesync::telemetry::PipelineTelemetry::default()),
    );
    db.put(&ctx, "tenant-x/products", json!(["anvil"])).expect("seed x");
    db.put(&ctx, "tenant-y/products", json!(["bellows"])).expect("seed y");
    db
}

fn pipeline(db: Arc<MemoryDatabase>, lister: Arc<ListProducts>) -> Pipeline {
    let config = SyncConfig::default();
    let components =
        PipelineComponents::in_memory(&config, db.clone(), Arc::new(EventHandlerRegistry::new()));
    standard_pipeline(&config, components)
        .expect("standard pipeline")
        .handler_arc("GetProductList", lister)
        .handler("AddProduct", AddProduct { db })
        .build()
        .expect("build")
}

fn member(tenant: &str) -> CallerContext {
    CallerContext::new(tenant, "u1").with_grant(Permission::TenantAdmin {
        tenant_id: tenant.into(),
    })
}

fn list(tenant: &str) -> RequestEnvelope {
    RequestEnvelope::query("GetProductList", member(tenant), Value::Null)
        .with_cache(CacheDescriptor::new("all"))
}

#[tokio::test]
async fn tenants_with_identical_queries_never_share_entries() {
    let db = seeded_db();
    let lister = Arc::new(ListProducts {
        db: db.clone(),
        calls: AtomicU32::new(0),
    });
    let pipeline = pipeline(db, lister.clone());

    let x = pipeline.dispatch(list("tenant-x")).await.expect("x");
    let y = pipeline.dispatch(list("tenant-y")).await.expect("y");
    assert_eq!(x, Outcome::Success(json!(["anvil"])));
    assert_eq!(y, Outcome::Success(json!(["bellows"])));
    assert_eq!(lister.calls.load(Ordering::SeqCst), 2);

    let x_again = pipeline.dispatch(list("tenant-x")).await.expect("x again");
    assert_eq!(x_again, x);
    assert_eq!(lister.calls.load(Ordering::SeqCst), 2);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 2);
}

#[tokio::test]
async fn command_evicts_only_its_own_tenant() {
    let db = seeded_db();
    let lister = Arc::new(ListProducts {
        db: db.clone(),
        calls: AtomicU32::new(0),
    });
    let pipeline = pipeline(db, lister.clone());
    pipeline.dispatch(list("tenant-x")).await.expect("warm x");
    pipeline.dispatch(list("tenant-y")).await.expect("warm y");

    let added = pipeline
        .dispatch(
            RequestEnvelope::command("AddProduct", member("tenant-x"), json!({"name": "tongs"}))
                .invalidating("GetProductList"),
        )
        .await
        .expect("add");
    assert!(added.is_success());

    let x = pipeline.dispatch(list("tenant-x")).await.expect("x");
    assert_eq!(x, Outcome::Success(json!(["anvil", "tongs"])));
    let y = pipeline.dispatch(list("tenant-y")).await.expect("y");
    assert_eq!(y, Outcome::Success(json!(["bellows"])));

    assert_eq!(lister.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn callers_from_another_tenant_cannot_read() {
    let db = seeded_db();
    let lister = Arc::new(ListProducts {
        db: db.clone(),
        calls: AtomicU32::new(0),
    });
    let pipeline = pipeline(db, lister.clone());
    pipeline.dispatch(list("tenant-x")).await.expect("warm x");

    let intruder = CallerContext::new("tenant-y", "u1").with_grant(Permission::Read {
        tenant_id: "tenant-x".into(),
        resource: None,
    });
    let err = pipeline
        .dispatch(
            RequestEnvelope::query("GetProductList", intruder, Value::Null)
                .with_cache(CacheDescriptor::new("all")),
        )
        .await
        .expect_err("cross-tenant grant does not apply");
    assert_eq!(err.code_str(), "permission_denied");
    assert_eq!(pipeline.metrics().cache_hits, 0);
}
