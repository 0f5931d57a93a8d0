//! Per-identity registration cooldown.
//!
//! A student standing in frame for several seconds is matched on every
//! recognition cycle; only the first match in each window is registered.

use crate::types::Identity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct RecognitionCooldownCache {
    window: Duration,
    /// Optional size cap. Evicting an entry only risks one extra registration attempt.
    capacity: Option<usize>,
    last_registered: Mutex<HashMap<Identity, Instant>>,
}

impl RecognitionCooldownCache {
    /// Unbounded cache; the identity population is small and finite.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            capacity: None,
            last_registered: Mutex::new(HashMap::new()),
        }
    }

    /// Cache that evicts the least recently registered identity past `capacity` entries.
    pub fn with_capacity(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: Some(capacity.max(1)),
            last_registered: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check-and-set: returns `true` and stamps `now` if `identity` was never
    /// registered or its last registration is at least `window` old.
    /// Otherwise returns `false` and leaves the entry untouched.
    pub fn should_register(&self, identity: &Identity, now: Instant) -> bool {
        let mut entries = self.last_registered.lock();

        if let Some(last) = entries.get(identity) {
            // Out-of-order timestamps saturate to zero and stay suppressed.
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        } else if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    tracing::debug!(identity = %oldest, "cooldown: evicting oldest entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(identity.clone(), now);
        true
    }

    /// Drop the entry for `identity` so its next match is registered again.
    ///
    /// Used when the durable write for a registration failed.
    pub fn forget(&self, identity: &Identity) {
        self.last_registered.lock().remove(identity);
    }

    pub fn len(&self) -> usize {
        self.last_registered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(10);

    fn ana() -> Identity {
        Identity::from("Ana_Silva")
    }

    #[test]
    fn test_first_sighting_registers() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        assert!(cache.should_register(&ana(), Instant::now()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_within_window_suppressed() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        let t1 = Instant::now();
        assert!(cache.should_register(&ana(), t1));
        assert!(!cache.should_register(&ana(), t1 + Duration::from_secs(3)));
        assert!(!cache.should_register(&ana(), t1 + Duration::from_millis(9_999)));
    }

    #[test]
    fn test_suppression_does_not_refresh_entry() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        let t1 = Instant::now();
        assert!(cache.should_register(&ana(), t1));
        assert!(!cache.should_register(&ana(), t1 + Duration::from_secs(9)));
        // Measured from t1, not from the suppressed attempt at t1 + 9s.
        assert!(cache.should_register(&ana(), t1 + WINDOW));
    }

    #[test]
    fn test_window_boundary_registers() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        let t1 = Instant::now();
        assert!(cache.should_register(&ana(), t1));
        assert!(cache.should_register(&ana(), t1 + WINDOW));
        assert!(cache.should_register(&ana(), t1 + WINDOW * 3));
    }

    #[test]
    fn test_identities_are_independent() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        let t1 = Instant::now();
        assert!(cache.should_register(&ana(), t1));
        assert!(cache.should_register(&Identity::from("Bob"), t1));
        assert!(!cache.should_register(&ana(), t1 + Duration::from_secs(1)));
    }

    #[test]
    fn test_out_of_order_time_suppressed() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        let t1 = Instant::now() + Duration::from_secs(60);
        assert!(cache.should_register(&ana(), t1));
        assert!(!cache.should_register(&ana(), t1 - Duration::from_secs(30)));
    }

    #[test]
    fn test_forget_allows_immediate_retry() {
        let cache = RecognitionCooldownCache::new(WINDOW);
        let t1 = Instant::now();
        assert!(cache.should_register(&ana(), t1));
        cache.forget(&ana());
        assert!(cache.should_register(&ana(), t1 + Duration::from_secs(1)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = RecognitionCooldownCache::with_capacity(WINDOW, 2);
        let t = Instant::now();
        assert!(cache.should_register(&Identity::from("a"), t));
        assert!(cache.should_register(&Identity::from("b"), t + Duration::from_secs(1)));
        assert!(cache.should_register(&Identity::from("c"), t + Duration::from_secs(2)));
        assert_eq!(cache.len(), 2);
        // "a" was evicted, so it registers again inside its window.
        assert!(cache.should_register(&Identity::from("a"), t + Duration::from_secs(3)));
        // "c" is still cached.
        assert!(!cache.should_register(&Identity::from("c"), t + Duration::from_secs(3)));
    }

    #[test]
    fn test_concurrent_check_and_set_registers_once() {
        let cache = Arc::new(RecognitionCooldownCache::new(WINDOW));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.should_register(&ana(), now))
            })
            .collect();
        let registered = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&r| r)
            .count();
        assert_eq!(registered, 1);
    }
}
