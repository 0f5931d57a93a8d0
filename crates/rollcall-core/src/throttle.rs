//! Rate limiting in front of the remote matcher.

use crate::frame::Frame;
use crate::matcher::{best_match, MatchError, RemoteMatcher};
use crate::presence_filter::PresenceFilter;
use crate::types::MatchResult;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum time between two remote calls.
    pub min_interval: Duration,
    /// Minimum similarity (0–100) for a candidate to count as a match.
    pub threshold: f32,
    /// Maximum number of faces the remote index reports per image.
    pub max_faces: u32,
    /// Upper bound on a single remote call.
    pub match_timeout: Duration,
    /// Extra pause after a transient failure, on top of `min_interval`.
    pub error_backoff: Duration,
    pub jpeg_quality: u8,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            threshold: 85.0,
            max_faces: 5,
            match_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(2),
            jpeg_quality: 85,
        }
    }
}

/// What a single throttled attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The interval since the last dispatch has not elapsed yet.
    NotDue,
    /// The local filter found no plausible face; no slot was spent.
    NoCandidate,
    /// A remote call was made (or attempted); carries the best match, if any.
    Dispatched(Option<MatchResult>),
}

#[derive(Default)]
struct ThrottleState {
    last_dispatch_at: Option<Instant>,
    /// Set after a transient failure; no dispatch before this instant.
    backoff_until: Option<Instant>,
}

/// Counters exposed through the daemon's status call.
#[derive(Debug, Default)]
pub struct ThrottleStats {
    pub dispatched: AtomicU64,
    pub filtered: AtomicU64,
    pub failed: AtomicU64,
}

pub struct RemoteMatchThrottler {
    matcher: Arc<dyn RemoteMatcher>,
    filter: Box<dyn PresenceFilter>,
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
    stats: ThrottleStats,
}

impl RemoteMatchThrottler {
    pub fn new(
        matcher: Arc<dyn RemoteMatcher>,
        filter: Box<dyn PresenceFilter>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            matcher,
            filter,
            config,
            state: Mutex::new(ThrottleState::default()),
            stats: ThrottleStats::default(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn stats(&self) -> &ThrottleStats {
        &self.stats
    }

    /// Match `frame` against the remote index if a slot is free and the
    /// frame plausibly contains a face. Returns the best match, if any.
    pub async fn maybe_match(&self, frame: &Frame) -> Option<MatchResult> {
        match self.attempt(frame, Instant::now()).await {
            Dispatch::Dispatched(result) => result,
            Dispatch::NotDue | Dispatch::NoCandidate => None,
        }
    }

    /// Like [`maybe_match`](Self::maybe_match), reporting why nothing was dispatched.
    pub async fn attempt(&self, frame: &Frame, now: Instant) -> Dispatch {
        if let Some(skip) = self.claim_slot(frame, now) {
            return skip;
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        let image = match frame.to_jpeg(self.config.jpeg_quality) {
            Ok(image) => image,
            Err(e) => {
                tracing::error!(seq = frame.sequence, error = %e, "failed to encode frame");
                return Dispatch::Dispatched(None);
            }
        };

        let started = Instant::now();
        let call = self
            .matcher
            .search(&image, self.config.threshold, self.config.max_faces);
        let outcome = match tokio::time::timeout(self.config.match_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MatchError::Transient(format!(
                "no response within {:?}",
                self.config.match_timeout
            ))),
        };

        match outcome {
            Ok(candidates) => {
                let best = best_match(&candidates, self.config.threshold).map(|m| MatchResult {
                    identity: m.identity.clone(),
                    confidence: m.similarity,
                    timestamp: Utc::now(),
                });
                match &best {
                    Some(m) => tracing::debug!(
                        identity = %m.identity,
                        confidence = m.confidence,
                        candidates = candidates.len(),
                        "remote match"
                    ),
                    None => tracing::debug!("no known face in frame"),
                }
                Dispatch::Dispatched(best)
            }
            Err(MatchError::Transient(reason)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    reason = %reason,
                    backoff = ?self.config.error_backoff,
                    "remote match failed; skipping cycle"
                );
                // Counted from when the failure came back, not from dispatch.
                let observed = now + started.elapsed();
                self.state.lock().backoff_until = Some(observed + self.config.error_backoff);
                Dispatch::Dispatched(None)
            }
            Err(MatchError::Permanent(reason)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(reason = %reason, "remote matcher rejected request");
                Dispatch::Dispatched(None)
            }
        }
    }

    /// Decide and reserve under one lock, so two overlapping callers can
    /// never both dispatch inside the same interval.
    ///
    /// Returns `Some(reason)` when the caller must not dispatch.
    fn claim_slot(&self, frame: &Frame, now: Instant) -> Option<Dispatch> {
        let mut state = self.state.lock();

        if let Some(until) = state.backoff_until {
            if now < until {
                return Some(Dispatch::NotDue);
            }
            state.backoff_until = None;
        }
        if let Some(last) = state.last_dispatch_at {
            if now.saturating_duration_since(last) < self.config.min_interval {
                return Some(Dispatch::NotDue);
            }
        }
        if !self.filter.has_candidate_face(frame) {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return Some(Dispatch::NoCandidate);
        }

        // Spent regardless of how the call turns out.
        state.last_dispatch_at = Some(now);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence_filter::{AlwaysCandidate, StatisticalPresenceFilter};
    use crate::testing::{flat_frame, textured_frame, FakeMatcher};
    use crate::types::Identity;

    fn throttler(matcher: Arc<FakeMatcher>) -> RemoteMatchThrottler {
        RemoteMatchThrottler::new(
            matcher,
            Box::new(StatisticalPresenceFilter::default()),
            ThrottleConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_dispatches_when_due() {
        let matcher = Arc::new(FakeMatcher::always("Ana_Silva", 92.0));
        let throttler = throttler(Arc::clone(&matcher));
        let result = throttler.maybe_match(&textured_frame(0)).await.unwrap();
        assert_eq!(result.identity, Identity::from("Ana_Silva"));
        assert_eq!(result.confidence, 92.0);
        assert_eq!(matcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_never_two_calls_within_interval() {
        let matcher = Arc::new(FakeMatcher::always("Ana_Silva", 92.0));
        let throttler = throttler(Arc::clone(&matcher));
        let t0 = Instant::now();
        let frame = textured_frame(0);

        for ms in (0..1000).step_by(50) {
            throttler.attempt(&frame, t0 + Duration::from_millis(ms)).await;
        }
        assert_eq!(matcher.calls(), 1);

        let due = throttler.attempt(&frame, t0 + Duration::from_millis(1000)).await;
        assert!(matches!(due, Dispatch::Dispatched(Some(_))));
        assert_eq!(matcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_filtered_frame_costs_nothing() {
        let matcher = Arc::new(FakeMatcher::always("Ana_Silva", 92.0));
        let throttler = throttler(Arc::clone(&matcher));
        let t0 = Instant::now();

        assert_eq!(throttler.attempt(&flat_frame(0), t0).await, Dispatch::NoCandidate);
        assert_eq!(matcher.calls(), 0);

        // The slot was not spent: a good frame right after is dispatched.
        let next = throttler
            .attempt(&textured_frame(1), t0 + Duration::from_millis(10))
            .await;
        assert!(matches!(next, Dispatch::Dispatched(Some(_))));
        assert_eq!(throttler.stats().filtered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_is_no_match() {
        let matcher = Arc::new(FakeMatcher::always("Ana_Silva", 80.0));
        let throttler = throttler(Arc::clone(&matcher));
        assert!(throttler.maybe_match(&textured_frame(0)).await.is_none());
        assert_eq!(matcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_spends_slot_and_backs_off() {
        let matcher = Arc::new(FakeMatcher::scripted(vec![
            Err(MatchError::Transient("throttled".into())),
            Ok(vec![]),
        ]));
        let throttler = throttler(Arc::clone(&matcher));
        let t0 = Instant::now();
        let frame = textured_frame(0);

        assert_eq!(throttler.attempt(&frame, t0).await, Dispatch::Dispatched(None));
        // min_interval has elapsed but the 2s error backoff has not.
        assert_eq!(
            throttler.attempt(&frame, t0 + Duration::from_millis(1500)).await,
            Dispatch::NotDue
        );
        assert_eq!(matcher.calls(), 1);

        assert_eq!(
            throttler.attempt(&frame, t0 + Duration::from_secs(2)).await,
            Dispatch::Dispatched(None)
        );
        assert_eq!(matcher.calls(), 2);
        assert_eq!(throttler.stats().failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_backoff_starts_after_slow_failure() {
        let matcher = Arc::new(
            FakeMatcher::scripted(vec![Err(MatchError::Transient("timed out".into()))])
                .with_delay(Duration::from_millis(300)),
        );
        let throttler = RemoteMatchThrottler::new(
            Arc::clone(&matcher) as Arc<dyn RemoteMatcher>,
            Box::new(AlwaysCandidate),
            ThrottleConfig {
                min_interval: Duration::from_millis(50),
                error_backoff: Duration::from_millis(200),
                ..ThrottleConfig::default()
            },
        );
        let frame = textured_frame(0);

        let first = throttler.attempt(&frame, Instant::now()).await;
        assert_eq!(first, Dispatch::Dispatched(None));
        // The call outlasted the backoff window; the backoff must still apply.
        let second = throttler.attempt(&frame, Instant::now()).await;
        assert_eq!(second, Dispatch::NotDue);
        assert_eq!(matcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_swallowed() {
        let matcher = Arc::new(FakeMatcher::scripted(vec![Err(MatchError::Permanent(
            "bad image".into(),
        ))]));
        let throttler = throttler(Arc::clone(&matcher));
        let t0 = Instant::now();
        let frame = textured_frame(0);
        assert_eq!(throttler.attempt(&frame, t0).await, Dispatch::Dispatched(None));
        assert_eq!(
            throttler.attempt(&frame, t0 + Duration::from_millis(100)).await,
            Dispatch::NotDue
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_matcher_times_out() {
        let matcher = Arc::new(FakeMatcher::always("Ana_Silva", 92.0).with_delay(Duration::from_secs(30)));
        let throttler = RemoteMatchThrottler::new(
            Arc::clone(&matcher) as Arc<dyn RemoteMatcher>,
            Box::new(AlwaysCandidate),
            ThrottleConfig {
                match_timeout: Duration::from_millis(200),
                ..ThrottleConfig::default()
            },
        );
        assert!(throttler.maybe_match(&textured_frame(0)).await.is_none());
        assert_eq!(throttler.stats().failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_slot() {
        let matcher = Arc::new(FakeMatcher::always("Ana_Silva", 92.0));
        let throttler = Arc::new(throttler(Arc::clone(&matcher)));
        let now = Instant::now();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let throttler = Arc::clone(&throttler);
                tokio::spawn(async move { throttler.attempt(&textured_frame(i), now).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(matcher.calls(), 1);
    }
}
