//! rollcall-core: Real-time attendance pipeline.
//!
//! Frames from a camera are buffered, filtered locally, matched against a
//! remote face index at a bounded rate, deduplicated by a per-identity
//! cooldown and recorded as presences in the open class session.

pub mod capture;
pub mod cooldown;
pub mod frame;
pub mod frame_buffer;
pub mod matcher;
pub mod pipeline;
pub mod presence_filter;
pub mod recorder;
pub mod session;
pub mod store;
pub mod throttle;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capture::{CaptureError, FrameSource, SourceOpener};
pub use cooldown::RecognitionCooldownCache;
pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use matcher::{FaceMatch, MatchError, RemoteMatcher};
pub use pipeline::{CaptureHealth, PipelineConfig, PipelineController, PipelineError, PipelineStatus};
pub use presence_filter::{AlwaysCandidate, PresenceFilter, StatisticalPresenceFilter};
pub use recorder::{PresenceRecorder, RecordFailure};
pub use session::{SessionError, SessionRegistry};
pub use store::{AttendanceStore, PresenceInsert, StoreError};
pub use throttle::{RemoteMatchThrottler, ThrottleConfig};
pub use types::{
    AttendanceEvent, EventOutcome, Identity, MatchResult, PresenceOutcome, PresenceRecord,
    Session, SessionId, SessionStatus,
};
