/// Deduplication store: refuses identical (recipient, body) pairs within a window.
///
/// Keys are SHA-256 digests of the pair, so bodies are not retained.
/// Records expire on their own: a lookup ignores and evicts stale
/// entries, and the LRU bound keeps memory flat under churn.
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::types::RecipientId;

/// Stable digest of a (recipient, body) pair.
pub type DedupKey = [u8; 32];

pub fn dedup_key(recipient: &RecipientId, body: &str) -> DedupKey {
    let mut hasher = Sha256::new();
    hasher.update(recipient.as_str().as_bytes());
    // Separator keeps ("a@b.c", "xy") and ("a@b.cx", "y") apart.
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hasher.finalize().into()
}

pub struct DedupStore {
    sent: LruCache<DedupKey, Instant>,
    window: Duration,
}

impl DedupStore {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sent: LruCache::new(capacity),
            window,
        }
    }

    /// Whether an identical pair was sent within the window.
    pub fn is_duplicate_at(&mut self, recipient: &RecipientId, body: &str, now: Instant) -> bool {
        let key = dedup_key(recipient, body);
        match self.sent.peek(&key).copied() {
            Some(sent_at) if now.saturating_duration_since(sent_at) < self.window => true,
            Some(_) => {
                self.sent.pop(&key);
                false
            }
            None => false,
        }
    }

    /// Remember a successful send.
    pub fn mark_sent_at(&mut self, recipient: &RecipientId, body: &str, now: Instant) {
        self.sent.put(dedup_key(recipient, body), now);
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let expired: Vec<DedupKey> = self
            .sent
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= self.window)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.sent.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> RecipientId {
        "628111@s.example.net".parse().unwrap()
    }

    fn bob() -> RecipientId {
        "628222@s.example.net".parse().unwrap()
    }

    fn store() -> DedupStore {
        DedupStore::new(Duration::from_secs(3600), 100)
    }

    #[test]
    fn duplicate_within_window() {
        let mut s = store();
        let t0 = Instant::now();
        assert!(!s.is_duplicate_at(&alice(), "pay 50k", t0));

        s.mark_sent_at(&alice(), "pay 50k", t0);
        assert!(s.is_duplicate_at(&alice(), "pay 50k", t0 + Duration::from_secs(60)));
    }

    #[test]
    fn different_body_or_recipient_is_not_duplicate() {
        let mut s = store();
        let t0 = Instant::now();
        s.mark_sent_at(&alice(), "pay 50k", t0);

        assert!(!s.is_duplicate_at(&alice(), "pay 60k", t0));
        assert!(!s.is_duplicate_at(&bob(), "pay 50k", t0));
    }

    #[test]
    fn record_expires_after_window() {
        let mut s = store();
        let t0 = Instant::now();
        s.mark_sent_at(&alice(), "pay 50k", t0);

        assert!(!s.is_duplicate_at(&alice(), "pay 50k", t0 + Duration::from_secs(3600)));
        // Lookup evicted the stale record.
        assert!(s.is_empty());
    }

    #[test]
    fn purge_removes_only_expired() {
        let mut s = store();
        let t0 = Instant::now();
        s.mark_sent_at(&alice(), "old", t0);
        s.mark_sent_at(&bob(), "new", t0 + Duration::from_secs(1800));

        assert_eq!(s.purge_expired_at(t0 + Duration::from_secs(3700)), 1);
        assert_eq!(s.len(), 1);
        assert!(s.is_duplicate_at(&bob(), "new", t0 + Duration::from_secs(3700)));
    }

    #[test]
    fn capacity_bounds_memory() {
        let mut s = DedupStore::new(Duration::from_secs(3600), 2);
        let t0 = Instant::now();
        s.mark_sent_at(&alice(), "1", t0);
        s.mark_sent_at(&alice(), "2", t0);
        s.mark_sent_at(&alice(), "3", t0);
        assert_eq!(s.len(), 2);
        assert!(!s.is_duplicate_at(&alice(), "1", t0));
    }

    #[test]
    fn key_separates_fields() {
        let a: RecipientId = "a@b.cx".parse().unwrap();
        let b: RecipientId = "a@b.c".parse().unwrap();
        assert_ne!(dedup_key(&a, "y"), dedup_key(&b, "xy"));
    }
}
