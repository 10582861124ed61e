use crate::pipeline::envelope::RequestKind;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    dispatches_total: AtomicU64,
    dispatch_errors: AtomicU64,
    rejections: AtomicU64,
    idempotent_replays: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    stale_drops: AtomicU64,
    coalesced_joins: AtomicU64,
    flushes: AtomicU64,
    total_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineMetrics {
    pub dispatches_total: u64,
    pub dispatch_errors: u64,
    pub rejections: u64,
    pub idempotent_replays: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub stale_drops: u64,
    pub coalesced_joins: u64,
    pub flushes: u64,
    pub avg_dispatch_latency_micros: u64,
}

impl PipelineTelemetry {
    pub fn record_dispatch(&self, latency_micros: u64, ok: bool, rejected: bool) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
        if !ok {
            self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
        }
        if rejected {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_replay(&self) {
        self.idempotent_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_drop(&self) {
        self.stale_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_join(&self) {
        self.coalesced_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetrics {
        let dispatches_total = self.dispatches_total.load(Ordering::Relaxed);
        let total_latency = self.total_latency_micros.load(Ordering::Relaxed);
        PipelineMetrics {
            dispatches_total,
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
            coalesced_joins: self.coalesced_joins.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            avg_dispatch_latency_micros: total_latency.checked_div(dispatches_total).unwrap_or(0),
        }
    }
}

pub trait DispatchTelemetryHook: Send + Sync {
    fn on_dispatch(&self, event: &DispatchTelemetryEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTelemetryEvent {
    pub request_type: String,
    pub kind: RequestKind,
    pub tenant_id: String,
    pub latency_micros: u64,
    pub ok: bool,
    pub rejected: bool,
    pub error: Option<String>,
}
