//! Deduplication Ledger
//!
//! A process-lifetime set of already-processed keys. Marking is a single
//! atomic test-and-set so two concurrent handlers for the same key can
//! never both proceed. The ledger is not persisted; a restart resets it,
//! which downstream idempotency keys make safe.

use dashmap::DashSet;

/// Set of keys that have already produced downstream output.
#[derive(Debug, Default)]
pub struct DedupLedger {
    processed: DashSet<String>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark `key` as processed.
    ///
    /// Returns `true` if the key was not yet marked (the caller should
    /// proceed), `false` if it had already been processed.
    pub fn mark(&self, key: &str) -> bool {
        self.processed.insert(key.to_owned())
    }

    /// Whether `key` has been marked, without marking it.
    pub fn contains(&self, key: &str) -> bool {
        self.processed.contains(key)
    }

    /// Number of marked keys. Exposed through pipeline metrics so ledger
    /// growth is observable in long-running deployments.
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_mark_wins() {
        let ledger = DedupLedger::new();
        assert!(ledger.mark("k1"));
        assert!(!ledger.mark("k1"));
        assert!(ledger.contains("k1"));
        assert!(!ledger.contains("k2"));
    }

    #[tokio::test]
    async fn test_concurrent_marking_admits_exactly_one() {
        let ledger = Arc::new(DedupLedger::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move { ledger.mark("shared") }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(ledger.len(), 1);
    }
}
