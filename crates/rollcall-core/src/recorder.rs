//! Session-gated, enrollment-validated presence writes.

use crate::session::SessionRegistry;
use crate::store::{AttendanceStore, PresenceInsert, StoreError};
use crate::types::{Identity, PresenceOutcome, SessionId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// A store failure, tagged with the session the write was aimed at.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("presence write for session {session_id} failed: {source}")]
pub struct RecordFailure {
    pub session_id: SessionId,
    #[source]
    pub source: StoreError,
}

/// Outcome of a `record` call and the session it was attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordReceipt {
    pub outcome: PresenceOutcome,
    pub session_id: Option<SessionId>,
}

pub struct PresenceRecorder {
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn AttendanceStore>,
}

impl PresenceRecorder {
    pub fn new(sessions: Arc<SessionRegistry>, store: Arc<dyn AttendanceStore>) -> Self {
        Self { sessions, store }
    }

    /// Record `identity` as present in the open session.
    ///
    /// Only a store failure is an error; every policy rejection is an
    /// outcome. Concurrent calls for the same identity are settled by the
    /// store's uniqueness constraint, not by this check. A session closed
    /// between the lookup and the insert is reported as `NoOpenSession`.
    pub fn record(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<RecordReceipt, RecordFailure> {
        let Some(session) = self.sessions.current() else {
            tracing::info!(identity = %identity, "recognized, but no session is open");
            return Ok(RecordReceipt {
                outcome: PresenceOutcome::NoOpenSession,
                session_id: None,
            });
        };

        let receipt = |outcome| RecordReceipt {
            outcome,
            session_id: Some(session.id),
        };

        let failed = |source| RecordFailure {
            session_id: session.id,
            source,
        };

        if !self
            .store
            .is_class_member(identity, &session.class_id)
            .map_err(failed)?
        {
            tracing::warn!(
                identity = %identity,
                class_id = %session.class_id,
                "recognized identity is not enrolled in this class"
            );
            return Ok(receipt(PresenceOutcome::NotEnrolled));
        }

        match self
            .store
            .insert_presence_if_absent(session.id, identity, now)
            .map_err(failed)?
        {
            PresenceInsert::Inserted => {
                tracing::info!(identity = %identity, session_id = session.id, "presence registered");
                Ok(receipt(PresenceOutcome::Registered))
            }
            PresenceInsert::AlreadyPresent => {
                tracing::debug!(identity = %identity, session_id = session.id, "presence already recorded");
                Ok(receipt(PresenceOutcome::AlreadyRecorded))
            }
            PresenceInsert::SessionClosed => {
                tracing::info!(
                    identity = %identity,
                    session_id = session.id,
                    "session closed before presence was written"
                );
                Ok(RecordReceipt {
                    outcome: PresenceOutcome::NoOpenSession,
                    session_id: None,
                })
            }
        }
    }
}
