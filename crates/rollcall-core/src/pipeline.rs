//! Capture → filter → throttle → match → cooldown → record.
//!
//! Two long-running activities share only the [`FrameBuffer`]:
//!
//! - the capture activity, a dedicated OS thread that owns the camera and
//!   publishes frames at sensor rate;
//! - the recognition activity, a tokio task that snapshots the buffer,
//!   asks the throttler for a match and hands registrations to short-lived
//!   blocking tasks so a slow store never stalls the cadence.
//!
//! Both stop on a `watch` signal. Every presence write is idempotent, so a
//! write still in flight at shutdown is allowed to finish on its own.

use crate::capture::{CaptureError, SourceOpener};
use crate::cooldown::RecognitionCooldownCache;
use crate::frame::Frame;
use crate::frame_buffer::FrameBuffer;
use crate::recorder::PresenceRecorder;
use crate::session::{SessionError, SessionRegistry};
use crate::store::AttendanceStore;
use crate::throttle::{Dispatch, RemoteMatchThrottler};
use crate::types::{AttendanceEvent, EventOutcome, MatchResult, PresenceOutcome, Session, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("camera error: {0}")]
    Camera(#[from] CaptureError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("capture thread exited during startup")]
    CaptureExited,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often the recognition activity looks at the frame buffer.
    pub poll_interval: Duration,
    /// Pause between captures; zero polls the camera at sensor rate.
    pub capture_interval: Duration,
    /// First retry delay after an unavailable frame; doubles up to `retry_max`.
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Consecutive unavailable frames before capture is reported degraded.
    pub unhealthy_after: u32,
    /// Number of recent attendance events kept for `recent_events`.
    pub event_log_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            capture_interval: Duration::ZERO,
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_secs(2),
            unhealthy_after: 5,
            event_log_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureHealth {
    Stopped,
    Healthy,
    /// Frames have been unavailable for a while; capture keeps retrying.
    Degraded,
    /// The camera is gone; capture has ended.
    Failed,
}

#[derive(Debug, Default)]
struct PipelineStats {
    cycles: AtomicU64,
    matches: AtomicU64,
    suppressed: AtomicU64,
    registered: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time view of the pipeline, serialized by the daemon's status call.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub capture: CaptureHealth,
    pub session: Option<Session>,
    pub frames_published: u64,
    pub cycles: u64,
    pub remote_calls: u64,
    pub filtered_frames: u64,
    pub remote_failures: u64,
    pub matches: u64,
    pub suppressed: u64,
    pub registered: u64,
    pub write_failures: u64,
}

struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<AttendanceEvent>>,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn push(&self, event: AttendanceEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Up to `limit` most recent events, oldest first.
    fn recent(&self, limit: usize) -> Vec<AttendanceEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }
}

/// State shared by the capture thread, the recognition task and write tasks.
/// Each field guards only its own invariant.
struct Shared {
    buffer: FrameBuffer,
    throttler: RemoteMatchThrottler,
    cooldown: RecognitionCooldownCache,
    sessions: Arc<SessionRegistry>,
    recorder: PresenceRecorder,
    events: broadcast::Sender<AttendanceEvent>,
    log: EventLog,
    health: watch::Sender<CaptureHealth>,
    stats: PipelineStats,
}

impl Shared {
    fn set_health(&self, health: CaptureHealth) {
        self.health.send_if_modified(|current| {
            if *current == health {
                return false;
            }
            *current = health;
            true
        });
    }

    /// One recognition cycle on `frame`.
    ///
    /// Returns `false` when the throttler was not due, so the same frame may
    /// be looked at again on the next tick.
    async fn run_cycle(self: Arc<Self>, frame: Arc<Frame>, now: Instant) -> bool {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let matched = match self.throttler.attempt(&frame, now).await {
            Dispatch::NotDue => return false,
            Dispatch::NoCandidate | Dispatch::Dispatched(None) => return true,
            Dispatch::Dispatched(Some(matched)) => matched,
        };
        self.stats.matches.fetch_add(1, Ordering::Relaxed);

        if !self.cooldown.should_register(&matched.identity, now) {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(identity = %matched.identity, "registered recently; suppressed");
            return true;
        }

        let shared = Arc::clone(&self);
        tokio::spawn(async move {
            let identity = matched.identity.clone();
            let writer = Arc::clone(&shared);
            let write = tokio::task::spawn_blocking(move || writer.record_presence(matched));
            if let Err(e) = write.await {
                tracing::error!(identity = %identity, error = %e, "presence write task failed");
                shared.cooldown.forget(&identity);
            }
        });
        true
    }

    fn record_presence(&self, matched: MatchResult) {
        let (outcome, session_id) = match self.recorder.record(&matched.identity, matched.timestamp) {
            Ok(receipt) => {
                if receipt.outcome == PresenceOutcome::Registered {
                    self.stats.registered.fetch_add(1, Ordering::Relaxed);
                }
                (EventOutcome::from(receipt.outcome), receipt.session_id)
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    identity = %matched.identity,
                    error = %e,
                    "presence write failed; will retry on next match"
                );
                self.cooldown.forget(&matched.identity);
                (EventOutcome::StoreFailed, Some(e.session_id))
            }
        };

        self.publish(AttendanceEvent {
            identity: matched.identity,
            session_id,
            outcome,
            confidence: matched.confidence,
            timestamp: matched.timestamp,
        });
    }

    fn publish(&self, event: AttendanceEvent) {
        self.log.push(event.clone());
        // No subscribers is fine; the log still has it.
        let _ = self.events.send(event);
    }
}

struct Running {
    stop: watch::Sender<bool>,
    recognition: JoinHandle<()>,
    capture: std::thread::JoinHandle<()>,
}

/// Owns the run/stop lifecycle and the session control surface.
pub struct PipelineController {
    shared: Arc<Shared>,
    opener: Arc<dyn SourceOpener>,
    config: PipelineConfig,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        opener: Arc<dyn SourceOpener>,
        throttler: RemoteMatchThrottler,
        cooldown: RecognitionCooldownCache,
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn AttendanceStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (health, _) = watch::channel(CaptureHealth::Stopped);
        let shared = Arc::new(Shared {
            buffer: FrameBuffer::new(),
            throttler,
            cooldown,
            recorder: PresenceRecorder::new(Arc::clone(&sessions), store),
            sessions,
            events,
            log: EventLog::new(config.event_log_capacity),
            health,
            stats: PipelineStats::default(),
        });
        Self {
            shared,
            opener,
            config,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Open the camera and start both activities.
    ///
    /// Fails fast if the camera cannot be opened; the controller stays
    /// usable and `start` can be retried.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let capture = {
            let shared = Arc::clone(&self.shared);
            let opener = Arc::clone(&self.opener);
            let config = self.config.clone();
            let stop = stop_rx.clone();
            std::thread::Builder::new()
                .name("rollcall-capture".into())
                .spawn(move || run_capture(opener.as_ref(), &shared, &config, stop, ready_tx))?
        };

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                join_capture(capture).await;
                return Err(PipelineError::Camera(e));
            }
            Err(_) => {
                join_capture(capture).await;
                return Err(PipelineError::CaptureExited);
            }
        }

        let recognition = tokio::spawn(recognition_loop(
            Arc::clone(&self.shared),
            self.config.poll_interval,
            stop_rx,
        ));

        *running = Some(Running {
            stop: stop_tx,
            recognition,
            capture,
        });
        tracing::info!("pipeline started");
        Ok(())
    }

    /// Signal both activities to stop and wait for them.
    ///
    /// An in-flight remote call finishes (it is timeout-bounded); no new
    /// cycle starts. Returns `false` if the pipeline was not running.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(active) = running.take() else {
            return false;
        };

        let _ = active.stop.send(true);
        if let Err(e) = active.recognition.await {
            tracing::error!(error = %e, "recognition task ended abnormally");
        }
        join_capture(active.capture).await;
        tracing::info!("pipeline stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Close any open session and open one for `class_id`.
    ///
    /// Touches the store; call from a blocking context.
    pub fn open_session(&self, class_id: &str) -> Result<SessionId, SessionError> {
        self.shared.sessions.open(class_id)
    }

    /// Close the open session; touches the store.
    pub fn close_session(&self) -> Result<usize, SessionError> {
        self.shared.sessions.close()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.shared.sessions.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.shared.events.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<CaptureHealth> {
        self.shared.health.subscribe()
    }

    /// Up to `limit` most recent attendance events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<AttendanceEvent> {
        self.shared.log.recent(limit)
    }

    pub async fn status(&self) -> PipelineStatus {
        let shared = &self.shared;
        let throttle = shared.throttler.stats();
        PipelineStatus {
            running: self.is_running().await,
            capture: *shared.health.borrow(),
            session: shared.sessions.current(),
            frames_published: shared.buffer.published(),
            cycles: shared.stats.cycles.load(Ordering::Relaxed),
            remote_calls: throttle.dispatched.load(Ordering::Relaxed),
            filtered_frames: throttle.filtered.load(Ordering::Relaxed),
            remote_failures: throttle.failed.load(Ordering::Relaxed),
            matches: shared.stats.matches.load(Ordering::Relaxed),
            suppressed: shared.stats.suppressed.load(Ordering::Relaxed),
            registered: shared.stats.registered.load(Ordering::Relaxed),
            write_failures: shared.stats.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Capture activity. Opens the camera on this thread and drops it here.
fn run_capture(
    opener: &dyn SourceOpener,
    shared: &Shared,
    config: &PipelineConfig,
    stop: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), CaptureError>>,
) {
    let mut source = match opener.open() {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "failed to open camera");
            shared.set_health(CaptureHealth::Failed);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let device = source.describe();
    tracing::info!(device = %device, "capture started");
    shared.set_health(CaptureHealth::Healthy);
    let _ = ready.send(Ok(()));

    let mut failures = 0u32;
    let mut backoff = config.retry_initial;

    // A dropped sender means the controller gave up on this run.
    while !*stop.borrow() && stop.has_changed().is_ok() {
        match source.next_frame() {
            Ok(frame) => {
                if failures >= config.unhealthy_after {
                    tracing::info!(device = %device, "camera recovered");
                }
                failures = 0;
                backoff = config.retry_initial;
                shared.set_health(CaptureHealth::Healthy);
                shared.buffer.publish(frame);
                if !config.capture_interval.is_zero() {
                    std::thread::sleep(config.capture_interval);
                }
            }
            Err(CaptureError::Unavailable(reason)) => {
                failures += 1;
                if failures == config.unhealthy_after {
                    tracing::warn!(device = %device, failures, reason = %reason, "camera degraded");
                    shared.set_health(CaptureHealth::Degraded);
                } else {
                    tracing::debug!(device = %device, failures, reason = %reason, "frame unavailable");
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(config.retry_max);
            }
            Err(e) => {
                tracing::error!(device = %device, error = %e, "capture ended");
                shared.set_health(CaptureHealth::Failed);
                break;
            }
        }
    }

    drop(source);
    tracing::info!(device = %device, "camera released");
    shared.health.send_if_modified(|health| {
        if *health == CaptureHealth::Failed {
            return false;
        }
        *health = CaptureHealth::Stopped;
        true
    });
}

async fn join_capture(handle: std::thread::JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::error!("capture thread panicked"),
        Err(e) => tracing::error!(error = %e, "failed to join capture thread"),
    }
}

/// Recognition activity.
async fn recognition_loop(
    shared: Arc<Shared>,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_generation = 0u64;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }
        if *stop.borrow() {
            break;
        }

        let Some(snapshot) = shared.buffer.take_snapshot() else {
            continue;
        };
        if snapshot.generation == last_generation {
            continue;
        }

        // Each cycle runs in its own task so a panic is contained to the cycle.
        let cycle = tokio::spawn(Arc::clone(&shared).run_cycle(snapshot.frame, Instant::now()));
        match cycle.await {
            Ok(true) => last_generation = snapshot.generation,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "recognition cycle failed; skipping frame");
                last_generation = snapshot.generation;
            }
        }
    }
    tracing::info!("recognition stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence_filter::StatisticalPresenceFilter;
    use crate::testing::{textured_frame, FakeMatcher, FakeOpener, MemoryStore};
    use crate::throttle::ThrottleConfig;
    use crate::types::Identity;

    struct Harness {
        controller: PipelineController,
        store: Arc<MemoryStore>,
        matcher: Arc<FakeMatcher>,
        counters: Arc<crate::testing::CameraCounters>,
    }

    fn harness(opener: FakeOpener, matcher: FakeMatcher) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.create_class("C");
        store.enroll("C", "Ana_Silva");
        let matcher = Arc::new(matcher);
        let counters = Arc::clone(&opener.counters);

        let dyn_store: Arc<dyn AttendanceStore> = store.clone();
        let sessions = Arc::new(SessionRegistry::new(Arc::clone(&dyn_store)).unwrap());
        let throttler = RemoteMatchThrottler::new(
            matcher.clone(),
            Box::new(StatisticalPresenceFilter::default()),
            ThrottleConfig {
                min_interval: Duration::from_millis(20),
                ..ThrottleConfig::default()
            },
        );
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(5),
            retry_initial: Duration::from_millis(2),
            retry_max: Duration::from_millis(10),
            unhealthy_after: 3,
            event_log_capacity: 4,
            ..PipelineConfig::default()
        };
        let controller = PipelineController::new(
            config,
            Arc::new(opener),
            throttler,
            RecognitionCooldownCache::new(Duration::from_secs(10)),
            sessions,
            dyn_store,
        );
        Harness {
            controller,
            store,
            matcher,
            counters,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<AttendanceEvent>) -> AttendanceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no attendance event within 5s")
            .unwrap()
    }

    async fn wait_for_health(rx: &mut watch::Receiver<CaptureHealth>, want: CaptureHealth) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|h| *h == want))
            .await
            .expect("health never reached")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registers_enrolled_identity_once() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::always("Ana_Silva", 92.0));
        let session_id = h.controller.open_session("C").unwrap();
        let mut events = h.controller.subscribe();

        h.controller.start().await.unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.identity, Identity::from("Ana_Silva"));
        assert_eq!(event.outcome, EventOutcome::Registered);
        assert_eq!(event.session_id, Some(session_id));

        // Keep matching for a while: the cooldown suppresses every repeat.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.controller.stop().await);

        assert!(h.matcher.calls() > 1);
        assert_eq!(h.store.presences(session_id).unwrap().len(), 1);
        let status = h.controller.status().await;
        assert!(!status.running);
        assert_eq!(status.frames_published, h.counters.frames.load(Ordering::SeqCst) as u64);
        assert_eq!(status.registered, 1);
        assert!(status.suppressed >= 1);
        assert_eq!(h.controller.recent_events(10).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_releases_camera() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::scripted(vec![]));
        let mut health = h.controller.health();
        h.controller.start().await.unwrap();
        assert!(h.controller.is_running().await);
        assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);

        assert!(h.controller.stop().await);
        assert!(!h.controller.is_running().await);
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);
        wait_for_health(&mut health, CaptureHealth::Stopped).await;

        // Stopping again is a no-op; starting again reopens the camera.
        assert!(!h.controller.stop().await);
        h.controller.start().await.unwrap();
        assert_eq!(h.counters.opened.load(Ordering::SeqCst), 2);
        h.controller.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_is_rejected() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::scripted(vec![]));
        h.controller.start().await.unwrap();
        assert!(matches!(
            h.controller.start().await,
            Err(PipelineError::AlreadyRunning)
        ));
        h.controller.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_camera_fails_start_only() {
        let h = harness(
            FakeOpener::missing(CaptureError::NotFound("/dev/video9".into())),
            FakeMatcher::scripted(vec![]),
        );
        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, PipelineError::Camera(CaptureError::NotFound(_))));
        assert!(!h.controller.is_running().await);
        assert_eq!(*h.controller.health().borrow(), CaptureHealth::Failed);

        // Sessions remain controllable.
        assert!(h.controller.open_session("C").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_open_session_still_updates_cooldown() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::always("Ana_Silva", 92.0));
        let mut events = h.controller.subscribe();
        h.controller.start().await.unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.outcome, EventOutcome::NoOpenSession);
        assert_eq!(event.session_id, None);
        h.controller.stop().await;

        assert_eq!(h.store.presence_count(), 0);
        assert_eq!(h.controller.shared.cooldown.len(), 1);
        assert_eq!(h.controller.recent_events(10).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unenrolled_identity_not_written() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::always("Bob", 95.0));
        h.controller.open_session("C").unwrap();
        let mut events = h.controller.subscribe();
        h.controller.start().await.unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.identity, Identity::from("Bob"));
        assert_eq!(event.outcome, EventOutcome::NotEnrolled);
        h.controller.stop().await;
        assert_eq!(h.store.presence_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_failure_reported_and_retried() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::always("Ana_Silva", 92.0));
        let session_id = h.controller.open_session("C").unwrap();
        h.store.fail_writes(true);
        let mut events = h.controller.subscribe();
        h.controller.start().await.unwrap();

        let failed = next_event(&mut events).await;
        assert_eq!(failed.outcome, EventOutcome::StoreFailed);
        assert_eq!(failed.session_id, Some(session_id));

        // The cooldown entry was dropped, so the next match tries again.
        h.store.fail_writes(false);
        let retried = loop {
            let event = next_event(&mut events).await;
            if event.outcome != EventOutcome::StoreFailed {
                break event;
            }
        };
        assert_eq!(retried.outcome, EventOutcome::Registered);
        h.controller.stop().await;
        assert_eq!(h.store.presence_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scenario_match_twice_inside_cooldown() {
        // Ana_Silva matched at 92 (threshold 85) at t=0s and t=3s, window 10s.
        let h = harness(FakeOpener::streaming(), FakeMatcher::always("Ana_Silva", 92.0));
        let session_id = h.controller.open_session("C").unwrap();
        let mut events = h.controller.subscribe();
        let shared = Arc::clone(&h.controller.shared);
        let frame = Arc::new(textured_frame(1));
        let t0 = Instant::now();

        assert!(Arc::clone(&shared).run_cycle(Arc::clone(&frame), t0).await);
        let event = next_event(&mut events).await;
        assert_eq!(event.outcome, EventOutcome::Registered);

        assert!(
            Arc::clone(&shared)
                .run_cycle(frame, t0 + Duration::from_secs(3))
                .await
        );
        assert_eq!(h.matcher.calls(), 2);
        assert_eq!(shared.stats.suppressed.load(Ordering::Relaxed), 1);
        assert_eq!(shared.stats.registered.load(Ordering::Relaxed), 1);
        assert_eq!(h.store.presences(session_id).unwrap().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unavailable_frames_degrade_health() {
        let opener = FakeOpener::scripted(
            vec![Ok(textured_frame(1))],
            CaptureError::Unavailable("timeout".into()),
        );
        let h = harness(opener, FakeMatcher::scripted(vec![]));
        let mut health = h.controller.health();
        h.controller.start().await.unwrap();
        wait_for_health(&mut health, CaptureHealth::Degraded).await;
        assert!(h.controller.stop().await);
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_fails_capture() {
        let opener = FakeOpener::scripted(
            vec![Ok(textured_frame(1))],
            CaptureError::Disconnected("unplugged".into()),
        );
        let h = harness(opener, FakeMatcher::scripted(vec![]));
        let mut health = h.controller.health();
        h.controller.start().await.unwrap();
        wait_for_health(&mut health, CaptureHealth::Failed).await;

        // The camera was released by the capture thread itself.
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.counters.released.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.controller.stop().await);
        assert_eq!(*h.controller.health().borrow(), CaptureHealth::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_cycle_is_skipped() {
        let matcher = FakeMatcher::always("Ana_Silva", 92.0).panicking_first(1);
        let h = harness(FakeOpener::streaming(), matcher);
        h.controller.open_session("C").unwrap();
        let mut events = h.controller.subscribe();
        h.controller.start().await.unwrap();

        // The first cycle panics inside the matcher; recognition carries on.
        let event = next_event(&mut events).await;
        assert_eq!(event.outcome, EventOutcome::Registered);
        assert!(h.matcher.calls() >= 2);
        assert!(h.controller.is_running().await);
        assert!(h.controller.stop().await);
        assert_eq!(h.store.presence_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_write_is_retried() {
        let h = harness(FakeOpener::streaming(), FakeMatcher::always("Ana_Silva", 92.0));
        let session_id = h.controller.open_session("C").unwrap();
        h.store.panic_next_writes(1);
        let mut events = h.controller.subscribe();
        h.controller.start().await.unwrap();

        // The panicked write publishes nothing and clears the cooldown entry,
        // so the next match registers.
        let event = next_event(&mut events).await;
        assert_eq!(event.outcome, EventOutcome::Registered);
        assert_eq!(event.session_id, Some(session_id));
        assert!(h.matcher.calls() >= 2);
        assert!(h.controller.stop().await);
        assert_eq!(h.store.presences(session_id).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_stops_when_controller_goes_away() {
        let opener = FakeOpener::streaming();
        let counters = Arc::clone(&opener.counters);
        let h = harness(FakeOpener::streaming(), FakeMatcher::scripted(vec![]));
        let shared = Arc::clone(&h.controller.shared);
        let config = PipelineConfig::default();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let capture = std::thread::spawn(move || {
            run_capture(&opener, &shared, &config, stop_rx, ready_tx)
        });
        ready_rx.await.unwrap().unwrap();
        // As when a `start` call is abandoned: the sender drops without sending.
        drop(stop_tx);

        tokio::time::timeout(Duration::from_secs(5), join_capture(capture))
            .await
            .expect("capture thread kept running");
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_log_keeps_newest() {
        let log = EventLog::new(2);
        for name in ["a", "b", "c"] {
            log.push(AttendanceEvent {
                identity: Identity::from(name),
                session_id: None,
                outcome: EventOutcome::NoOpenSession,
                confidence: 90.0,
                timestamp: chrono::Utc::now(),
            });
        }
        let recent = log.recent(10);
        let names: Vec<_> = recent.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(log.recent(1)[0].identity.as_str(), "c");
    }
}
