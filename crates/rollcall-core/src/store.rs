//! Durable store capability.
//!
//! Every method is atomic on its own; the pipeline never spans a
//! transaction across calls.

use crate::types::{Identity, PresenceRecord, Session, SessionId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection lost or database locked past the busy timeout.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
}

/// What `insert_presence_if_absent` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceInsert {
    Inserted,
    /// A row for this session and identity already exists.
    AlreadyPresent,
    /// The session was closed before the write landed; nothing was written.
    SessionClosed,
}

pub trait AttendanceStore: Send + Sync {
    fn class_exists(&self, class_id: &str) -> Result<bool, StoreError>;

    fn is_class_member(&self, identity: &Identity, class_id: &str) -> Result<bool, StoreError>;

    /// Insert a presence row unless one already exists for the pair or the
    /// session is no longer open. The status check and the insert are one
    /// atomic step.
    fn insert_presence_if_absent(
        &self,
        session_id: SessionId,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<PresenceInsert, StoreError>;

    /// Close every open session and open a new one for `class_id`, in one transaction.
    fn open_session(&self, class_id: &str, at: DateTime<Utc>) -> Result<Session, StoreError>;

    /// Close every open session. Returns how many were closed.
    fn close_open_sessions(&self, at: DateTime<Utc>) -> Result<usize, StoreError>;

    fn current_session(&self) -> Result<Option<Session>, StoreError>;

    fn presences(&self, session_id: SessionId) -> Result<Vec<PresenceRecord>, StoreError>;
}
