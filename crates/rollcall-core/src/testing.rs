//! In-memory fakes of the camera, remote matcher and store.

use crate::capture::{CaptureError, FrameSource, SourceOpener};
use crate::frame::Frame;
use crate::matcher::{FaceMatch, MatchError, RemoteMatcher};
use crate::store::{AttendanceStore, PresenceInsert, StoreError};
use crate::types::{Identity, PresenceRecord, Session, SessionId, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A 64x48 frame with enough central texture to pass the statistical filter.
pub fn textured_frame(sequence: u32) -> Frame {
    let (w, h) = (64u32, 48u32);
    let data = (0..h)
        .flat_map(|y| (0..w).map(move |x| ((x * 37 + y * 91) % 200 + 40) as u8))
        .collect();
    Frame::new(data, w, h, sequence)
}

/// A uniform mid-gray 64x48 frame: an empty scene.
pub fn flat_frame(sequence: u32) -> Frame {
    Frame::new(vec![128; 64 * 48], 64, 48, sequence)
}

/// Decrement `counter` if positive; `true` when a unit was taken.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    classes: HashSet<String>,
    enrollments: HashSet<(String, Identity)>,
    sessions: Vec<Session>,
    presences: Vec<PresenceRecord>,
}

/// Store with the same atomicity as the SQLite one: one lock per call.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fail_writes: AtomicBool,
    panic_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_class(&self, class_id: &str) {
        self.inner.lock().classes.insert(class_id.to_string());
    }

    pub fn enroll(&self, class_id: &str, identity: &str) {
        self.inner
            .lock()
            .enrollments
            .insert((class_id.to_string(), Identity::from(identity)));
    }

    /// Make presence inserts fail with `StoreError::Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` presence inserts panic.
    pub fn panic_next_writes(&self, n: usize) {
        self.panic_writes.store(n, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.lock().sessions.clone()
    }

    pub fn presence_count(&self) -> usize {
        self.inner.lock().presences.len()
    }
}

impl AttendanceStore for MemoryStore {
    fn class_exists(&self, class_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().classes.contains(class_id))
    }

    fn is_class_member(&self, identity: &Identity, class_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .enrollments
            .contains(&(class_id.to_string(), identity.clone())))
    }

    fn insert_presence_if_absent(
        &self,
        session_id: SessionId,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<PresenceInsert, StoreError> {
        if take_one(&self.panic_writes) {
            panic!("injected store panic");
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        let mut inner = self.inner.lock();
        let status = inner
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.status)
            .ok_or_else(|| StoreError::Query(format!("no session {session_id}")))?;
        if status != SessionStatus::Open {
            return Ok(PresenceInsert::SessionClosed);
        }
        let exists = inner
            .presences
            .iter()
            .any(|p| p.session_id == session_id && &p.identity == identity);
        if exists {
            return Ok(PresenceInsert::AlreadyPresent);
        }
        inner.presences.push(PresenceRecord {
            session_id,
            identity: identity.clone(),
            recorded_at: at,
        });
        Ok(PresenceInsert::Inserted)
    }

    fn open_session(&self, class_id: &str, at: DateTime<Utc>) -> Result<Session, StoreError> {
        let mut inner = self.inner.lock();
        for session in inner.sessions.iter_mut() {
            if session.status == SessionStatus::Open {
                session.status = SessionStatus::Closed;
                session.closed_at = Some(at);
            }
        }
        let session = Session {
            id: inner.sessions.len() as SessionId + 1,
            class_id: class_id.to_string(),
            status: SessionStatus::Open,
            opened_at: at,
            closed_at: None,
        };
        inner.sessions.push(session.clone());
        Ok(session)
    }

    fn close_open_sessions(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let mut closed = 0;
        for session in inner.sessions.iter_mut() {
            if session.status == SessionStatus::Open {
                session.status = SessionStatus::Closed;
                session.closed_at = Some(at);
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn current_session(&self) -> Result<Option<Session>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .iter()
            .find(|s| s.status == SessionStatus::Open)
            .cloned())
    }

    fn presences(&self, session_id: SessionId) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .presences
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Remote matcher
// ----------------------------------------------------------------------------

type Reply = Result<Vec<FaceMatch>, MatchError>;

/// Replays scripted replies, then a fixed fallback reply.
pub struct FakeMatcher {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    panics: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeMatcher {
    /// Every call reports `identity` at `similarity`.
    pub fn always(identity: &str, similarity: f32) -> Self {
        Self::with_fallback(Ok(vec![FaceMatch {
            identity: Identity::from(identity),
            similarity,
        }]))
    }

    /// Replays `replies` in order, then reports no faces.
    pub fn scripted(replies: Vec<Reply>) -> Self {
        let matcher = Self::with_fallback(Ok(Vec::new()));
        *matcher.script.lock() = replies.into();
        matcher
    }

    fn with_fallback(fallback: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            panics: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Panic inside the first `n` calls instead of replying.
    pub fn panicking_first(self, n: usize) -> Self {
        self.panics.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteMatcher for FakeMatcher {
    async fn search(
        &self,
        _image_jpeg: &[u8],
        _threshold: f32,
        max_faces: u32,
    ) -> Result<Vec<FaceMatch>, MatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.panics) {
            panic!("injected matcher panic");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        let reply = scripted.unwrap_or_else(|| self.fallback.clone());
        reply.map(|mut faces| {
            faces.truncate(max_faces as usize);
            faces
        })
    }
}

// ----------------------------------------------------------------------------
// Camera
// ----------------------------------------------------------------------------

/// Shared observations about fake cameras opened by a [`FakeOpener`].
#[derive(Default)]
pub struct CameraCounters {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub frames: AtomicUsize,
}

pub struct FakeCamera {
    script: VecDeque<Result<Frame, CaptureError>>,
    /// Once the script is exhausted: produce textured frames, or fail with this.
    exhausted: Option<CaptureError>,
    frame_interval: Duration,
    sequence: u32,
    counters: Arc<CameraCounters>,
}

impl FrameSource for FakeCamera {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        std::thread::sleep(self.frame_interval);
        self.sequence += 1;
        let next = match self.script.pop_front() {
            Some(step) => step,
            None => match &self.exhausted {
                Some(err) => Err(err.clone()),
                None => Ok(textured_frame(self.sequence)),
            },
        };
        if next.is_ok() {
            self.counters.frames.fetch_add(1, Ordering::SeqCst);
        }
        next
    }

    fn describe(&self) -> String {
        "fake://camera".to_string()
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens [`FakeCamera`]s that replay a script of frames and errors.
pub struct FakeOpener {
    script: Vec<Result<Frame, CaptureError>>,
    exhausted: Option<CaptureError>,
    open_error: Option<CaptureError>,
    frame_interval: Duration,
    pub counters: Arc<CameraCounters>,
}

impl FakeOpener {
    /// Endless textured frames every 5ms.
    pub fn streaming() -> Self {
        Self {
            script: Vec::new(),
            exhausted: None,
            open_error: None,
            frame_interval: Duration::from_millis(5),
            counters: Arc::new(CameraCounters::default()),
        }
    }

    /// Replay `script`, then fail every read with `then`.
    pub fn scripted(script: Vec<Result<Frame, CaptureError>>, then: CaptureError) -> Self {
        Self {
            script,
            exhausted: Some(then),
            ..Self::streaming()
        }
    }

    /// Opening the camera fails.
    pub fn missing(err: CaptureError) -> Self {
        Self {
            open_error: Some(err),
            ..Self::streaming()
        }
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCamera {
            script: self.script.clone().into(),
            exhausted: self.exhausted.clone(),
            frame_interval: self.frame_interval,
            sequence: 0,
            counters: Arc::clone(&self.counters),
        }))
    }
}
