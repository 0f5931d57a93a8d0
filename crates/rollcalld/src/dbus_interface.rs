use crate::remote::HttpMatcher;
use rollcall_core::{AttendanceEvent, MatchError, PipelineController, PipelineError, SessionError};
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Cap on `RecentEvents` so a caller cannot ask for an unbounded reply.
const MAX_RECENT_EVENTS: u32 = 1000;

/// D-Bus control surface of the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    controller: Arc<PipelineController>,
    matcher: Arc<HttpMatcher>,
}

impl AttendanceService {
    pub fn new(controller: Arc<PipelineController>, matcher: Arc<HttpMatcher>) -> Self {
        Self {
            controller,
            matcher,
        }
    }
}

fn pipeline_error(e: PipelineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn session_error(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::InvalidClass(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        SessionError::Store(_) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn match_error(e: MatchError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn join_error(e: tokio::task::JoinError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("internal error: {e}"))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Open the camera and start recognizing.
    async fn start(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start requested");
        self.controller.start().await.map_err(pipeline_error)
    }

    /// Stop recognizing and release the camera. Returns false if already stopped.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        Ok(self.controller.stop().await)
    }

    /// Close any open session and open one for `class_id`.
    async fn open_session(&self, class_id: String) -> zbus::fdo::Result<i64> {
        tracing::info!(class_id = %class_id, "open_session requested");
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.open_session(&class_id))
            .await
            .map_err(join_error)?
            .map_err(session_error)
    }

    /// Close the open session. Returns the number of sessions closed.
    async fn close_session(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("close_session requested");
        let controller = Arc::clone(&self.controller);
        let closed = tokio::task::spawn_blocking(move || controller.close_session())
            .await
            .map_err(join_error)?
            .map_err(session_error)?;
        Ok(closed as u32)
    }

    /// Pipeline status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.controller.status().await;
        let mut value = serde_json::to_value(&status)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["version"] = serde_json::Value::from(env!("CARGO_PKG_VERSION"));
        Ok(value.to_string())
    }

    /// Up to `limit` most recent attendance events as a JSON array, oldest first.
    async fn recent_events(&self, limit: u32) -> zbus::fdo::Result<String> {
        let events = self
            .controller
            .recent_events(limit.min(MAX_RECENT_EVENTS) as usize);
        serde_json::to_string(&events).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Create the remote face collection if missing. Returns true if it was created.
    async fn create_collection(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("create_collection requested");
        self.matcher.create_collection().await.map_err(match_error)
    }

    /// Faces stored in the remote collection as a JSON array.
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        let faces = self.matcher.list_faces().await.map_err(match_error)?;
        serde_json::to_string(&faces).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Delete every face in the remote collection. Returns how many were deleted.
    async fn clear_faces(&self) -> zbus::fdo::Result<u32> {
        tracing::warn!("clear_faces requested");
        let deleted = self.matcher.clear_faces().await.map_err(match_error)?;
        Ok(deleted as u32)
    }

    /// Emitted for every recognized identity, with the event as JSON.
    #[zbus(signal)]
    pub async fn attendance(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}

/// Serialize an event for the `Attendance` signal.
pub fn event_json(event: &AttendanceEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize attendance event");
        String::from("{}")
    })
}
