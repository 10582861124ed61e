use crate::error::PipelineError;
use std::time::Duration;

/// What the idempotency stage does when its store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum IdempotencyFailureMode {
    /// Reject the command. Safe default for mutating operations.
    #[default]
    FailClosed,
    /// Execute without a dedup guarantee and log a warning.
    FailOpen,
}

/// Runtime configuration shared by the pipeline stages and stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub idempotency_ttl_secs: u64,
    pub idempotency_wait_timeout_ms: u64,
    pub idempotency_claim_lease_ms: u64,
    pub idempotency_sweep_interval_ms: u64,
    pub idempotency_failure_mode: IdempotencyFailureMode,
    pub debounce_window_ms: u64,
    pub cache_capacity: usize,
    pub default_cache_ttl_secs: u64,
    pub reload_after_submit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: 24 * 60 * 60,
            idempotency_wait_timeout_ms: 30_000,
            idempotency_claim_lease_ms: 60_000,
            idempotency_sweep_interval_ms: 60_000,
            idempotency_failure_mode: IdempotencyFailureMode::FailClosed,
            debounce_window_ms: 500,
            cache_capacity: 1024,
            default_cache_ttl_secs: 60,
            reload_after_submit: true,
        }
    }
}

impl SyncConfig {
    pub fn production() -> Self {
        Self {
            idempotency_failure_mode: IdempotencyFailureMode::FailClosed,
            ..Self::default()
        }
    }

    /// Short retention and fail-open dedup so a missing local store does not
    /// block iteration.
    pub fn development() -> Self {
        Self {
            idempotency_ttl_secs: 10 * 60,
            idempotency_failure_mode: IdempotencyFailureMode::FailOpen,
            default_cache_ttl_secs: 5,
            ..Self::default()
        }
    }

    /// Profile for highly interactive screens: shorter debounce so pushed
    /// changes surface quickly, smaller cache.
    pub fn low_latency() -> Self {
        Self {
            debounce_window_ms: 150,
            cache_capacity: 256,
            default_cache_ttl_secs: 15,
            ..Self::default()
        }
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_failure_mode(mut self, mode: IdempotencyFailureMode) -> Self {
        self.idempotency_failure_mode = mode;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_reload_after_submit(mut self, enabled: bool) -> Self {
        self.reload_after_submit = enabled;
        self
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn idempotency_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.idempotency_wait_timeout_ms)
    }

    pub fn idempotency_claim_lease(&self) -> Duration {
        Duration::from_millis(self.idempotency_claim_lease_ms)
    }

    pub fn idempotency_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idempotency_sweep_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl_secs)
    }
}

pub fn validate_config(config: &SyncConfig) -> Result<(), PipelineError> {
    if config.idempotency_ttl_secs == 0 {
        return Err(PipelineError::InvalidConfig {
            message: "idempotency_ttl_secs must be > 0".into(),
        });
    }
    if config.idempotency_wait_timeout_ms == 0 {
        return Err(PipelineError::InvalidConfig {
            message: "idempotency_wait_timeout_ms must be > 0".into(),
        });
    }
    if config.idempotency_claim_lease_ms < config.idempotency_wait_timeout_ms {
        return Err(PipelineError::InvalidConfig {
            message: "idempotency_claim_lease_ms must be >= idempotency_wait_timeout_ms".into(),
        });
    }
    if config.idempotency_sweep_interval_ms == 0 {
        return Err(PipelineError::InvalidConfig {
            message: "idempotency_sweep_interval_ms must be > 0".into(),
        });
    }
    if config.debounce_window_ms == 0 {
        return Err(PipelineError::InvalidConfig {
            message: "debounce_window_ms must be > 0".into(),
        });
    }
    if config.cache_capacity == 0 {
        return Err(PipelineError::InvalidConfig {
            message: "cache_capacity must be > 0".into(),
        });
    }
    Ok(())
}
