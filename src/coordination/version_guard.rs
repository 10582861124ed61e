use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestVersionToken {
    pub logical_key: String,
    pub sequence: u64,
}

/// Per-key monotonically increasing request sequence.
///
/// Only the newest issued token for a key may apply its result; anything
/// older is stale. Callers must check `should_apply` synchronously under the
/// lock that guards the state being mutated.
#[derive(Debug, Default)]
pub struct VersionedResultGuard {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl VersionedResultGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, logical_key: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(logical_key) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.counters
                .write()
                .entry(logical_key.to_string())
                .or_default(),
        )
    }

    pub fn issue(&self, logical_key: &str) -> RequestVersionToken {
        let sequence = self.counter(logical_key).fetch_add(1, Ordering::SeqCst) + 1;
        RequestVersionToken {
            logical_key: logical_key.to_string(),
            sequence,
        }
    }

    pub fn should_apply(&self, token: &RequestVersionToken) -> bool {
        self.current(&token.logical_key) == token.sequence
    }

    /// Latest issued sequence, 0 when nothing was issued.
    pub fn current(&self, logical_key: &str) -> u64 {
        self.counters
            .read()
            .get(logical_key)
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::VersionedResultGuard;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn newer_token_makes_older_stale() {
        let guard = VersionedResultGuard::new();
        let first = guard.issue("products");
        assert!(guard.should_apply(&first));
        let second = guard.issue("products");
        assert!(!guard.should_apply(&first));
        assert!(guard.should_apply(&second));
        assert_eq!(guard.current("products"), 2);
    }

    #[test]
    fn keys_are_versioned_independently() {
        let guard = VersionedResultGuard::new();
        let a = guard.issue("a");
        guard.issue("b");
        guard.issue("b");
        assert!(guard.should_apply(&a));
        assert_eq!(guard.current("missing"), 0);
    }

    proptest! {
        #[test]
        fn only_latest_token_per_key_applies(keys in proptest::collection::vec(0u8..4, 1..64)) {
            let guard = VersionedResultGuard::new();
            let tokens: Vec<_> = keys
                .iter()
                .map(|k| guard.issue(&format!("key-{k}")))
                .collect();
            let mut latest: HashMap<String, u64> = HashMap::new();
            for token in &tokens {
                latest.insert(token.logical_key.clone(), token.sequence);
            }
            for token in &tokens {
                prop_assert_eq!(
                    guard.should_apply(token),
                    latest[&token.logical_key] == token.sequence
                );
            }
        }
    }
}
