use crate::error::PipelineError;
use crate::permission::CallerContext;
use crate::pipeline::envelope::Outcome;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Query cache key `{request_type}:{tenant}:{user}:{params}`.
///
/// The first three segments are escaped so a `:` inside a tenant or user id
/// cannot shift segment boundaries. Construction fails without both a tenant
/// and a user, so a key can never be shared across principals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compose(request_type: &str, caller: &CallerContext, params: &str) -> Option<Self> {
        if caller.is_anonymous() {
            return None;
        }
        Some(Self(format!(
            "{}{}:{}",
            Self::tenant_prefix(request_type, &caller.tenant_id),
            escape_segment(&caller.user_id),
            params
        )))
    }

    /// Prefix shared by every user's entries for one query type in a tenant.
    pub fn tenant_prefix(request_type: &str, tenant_id: &str) -> String {
        format!(
            "{}:{}:",
            escape_segment(request_type),
            escape_segment(tenant_id)
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}

#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Outcome>, PipelineError>;
    async fn insert(&self, key: CacheKey, outcome: Outcome, ttl: Duration)
    -> Result<(), PipelineError>;
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, PipelineError>;
    fn len(&self) -> usize;
}

#[derive(Debug)]
struct CacheEntry {
    outcome: Outcome,
    expires_at: Instant,
}

/// Bounded in-process cache; least recently used entries go first.
#[derive(Debug)]
pub struct LruQueryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl LruQueryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl QueryCache for LruQueryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Outcome>, PipelineError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.outcome.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn insert(
        &self,
        key: CacheKey,
        outcome: Outcome,
        ttl: Duration,
    ) -> Result<(), PipelineError> {
        self.entries.lock().put(
            key,
            CacheEntry {
                outcome,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, PipelineError> {
        let mut entries = self.entries.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.as_str().starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
