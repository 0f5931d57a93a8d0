use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database key of an attendance session.
pub type SessionId = i64;

/// Stable external identifier of an enrolled person.
///
/// The pipeline only ever compares identities for equality; the string is
/// whatever the remote face index returns for a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an identity from a free-form name, restricted to the alphabet
    /// accepted by the remote face index (`[A-Za-z0-9_.\-:]`).
    ///
    /// Whitespace runs become a single `_`, every other character outside
    /// the alphabet is dropped: `"Ana  Silva!"` becomes `"Ana_Silva"`.
    pub fn normalized(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        let mut in_space = false;
        for c in raw.trim().chars() {
            if c.is_whitespace() {
                if !in_space {
                    out.push('_');
                }
                in_space = true;
                continue;
            }
            in_space = false;
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':') {
                out.push(c);
            }
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A positive result from the remote matcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Identity,
    /// Similarity reported by the remote matcher, 0–100.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

/// A bounded period during which presence can be recorded for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub class_id: String,
    pub status: SessionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A durable presence row, unique per (session, identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub identity: Identity,
    pub recorded_at: DateTime<Utc>,
}

/// Result of attempting to record presence. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceOutcome {
    Registered,
    NoOpenSession,
    NotEnrolled,
    AlreadyRecorded,
}

/// Outcome attached to an attendance event published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Registered,
    NoOpenSession,
    NotEnrolled,
    AlreadyRecorded,
    /// The store could not be reached; the identity will be retried on its next match.
    StoreFailed,
}

impl From<PresenceOutcome> for EventOutcome {
    fn from(outcome: PresenceOutcome) -> Self {
        match outcome {
            PresenceOutcome::Registered => EventOutcome::Registered,
            PresenceOutcome::NoOpenSession => EventOutcome::NoOpenSession,
            PresenceOutcome::NotEnrolled => EventOutcome::NotEnrolled,
            PresenceOutcome::AlreadyRecorded => EventOutcome::AlreadyRecorded,
        }
    }
}

/// One recognized-and-processed identity, as surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub identity: Identity,
    pub session_id: Option<SessionId>,
    pub outcome: EventOutcome,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}
