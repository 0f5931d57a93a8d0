//! The single open attendance session.

use crate::store::{AttendanceStore, StoreError};
use crate::types::{Session, SessionId};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid class: {0:?}")]
    InvalidClass(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tracks the open session, if any.
///
/// `open` and `close` are serialized by `transition`; the cached session is
/// swapped whole under `current`, so readers never see a half-updated value.
/// The store's own transaction enforces the one-open-session invariant for
/// anything writing to the same database.
pub struct SessionRegistry {
    store: Arc<dyn AttendanceStore>,
    transition: Mutex<()>,
    current: RwLock<Option<Session>>,
}

impl SessionRegistry {
    /// Create the registry, adopting a session left open in the store.
    pub fn new(store: Arc<dyn AttendanceStore>) -> Result<Self, SessionError> {
        let current = store.current_session()?;
        if let Some(session) = &current {
            tracing::info!(
                session_id = session.id,
                class_id = %session.class_id,
                "resuming open session"
            );
        }
        Ok(Self {
            store,
            transition: Mutex::new(()),
            current: RwLock::new(current),
        })
    }

    /// Close any open session and open a new one for `class_id`.
    pub fn open(&self, class_id: &str) -> Result<SessionId, SessionError> {
        let class_id = class_id.trim();
        if class_id.is_empty() {
            return Err(SessionError::InvalidClass(class_id.to_string()));
        }

        let _transition = self.transition.lock();
        if !self.store.class_exists(class_id)? {
            return Err(SessionError::InvalidClass(class_id.to_string()));
        }

        let session = self.store.open_session(class_id, Utc::now())?;
        let session_id = session.id;
        let previous = self.current.write().replace(session);

        if let Some(previous) = previous {
            tracing::info!(
                session_id = previous.id,
                class_id = %previous.class_id,
                "session closed by newer session"
            );
        }
        tracing::info!(session_id, class_id, "session opened");
        Ok(session_id)
    }

    /// Close the open session. Returns the number closed (0 if none was open).
    pub fn close(&self) -> Result<usize, SessionError> {
        let _transition = self.transition.lock();
        let closed = self.store.close_open_sessions(Utc::now())?;
        let previous = self.current.write().take();
        if let Some(previous) = previous {
            tracing::info!(session_id = previous.id, "session closed");
        }
        Ok(closed)
    }

    /// The currently open session, if any.
    pub fn current(&self) -> Option<Session> {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use crate::types::SessionStatus;

    fn registry() -> (Arc<MemoryStore>, SessionRegistry) {
        let store = Arc::new(MemoryStore::new());
        store.create_class("C");
        store.create_class("D");
        let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn AttendanceStore>).unwrap();
        (store, registry)
    }

    #[test]
    fn test_starts_closed() {
        let (_, registry) = registry();
        assert!(registry.current().is_none());
    }

    #[test]
    fn test_open_then_open_leaves_only_second() {
        let (store, registry) = registry();
        let first = registry.open("C").unwrap();
        let second = registry.open("D").unwrap();
        assert_ne!(first, second);

        let current = registry.current().unwrap();
        assert_eq!(current.id, second);
        assert_eq!(current.class_id, "D");

        let sessions = store.sessions();
        let open: Vec<_> = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Open)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second);
        let closed = sessions.iter().find(|s| s.id == first).unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.closed_at.is_some());
    }

    #[test]
    fn test_close_counts() {
        let (_, registry) = registry();
        assert_eq!(registry.close().unwrap(), 0);
        registry.open("C").unwrap();
        assert_eq!(registry.close().unwrap(), 1);
        assert!(registry.current().is_none());
        assert_eq!(registry.close().unwrap(), 0);
    }

    #[test]
    fn test_open_rejects_empty_class() {
        let (_, registry) = registry();
        assert_eq!(
            registry.open("  "),
            Err(SessionError::InvalidClass(String::new()))
        );
    }

    #[test]
    fn test_open_rejects_unknown_class_and_keeps_current() {
        let (_, registry) = registry();
        let id = registry.open("C").unwrap();
        assert!(matches!(
            registry.open("nope"),
            Err(SessionError::InvalidClass(_))
        ));
        assert_eq!(registry.current().unwrap().id, id);
    }

    #[test]
    fn test_resumes_session_left_open() {
        let (store, registry) = registry();
        let id = registry.open("C").unwrap();
        drop(registry);
        let resumed = SessionRegistry::new(store as Arc<dyn AttendanceStore>).unwrap();
        assert_eq!(resumed.current().unwrap().id, id);
    }

    #[test]
    fn test_concurrent_opens_leave_one_open() {
        let (store, registry) = registry();
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let class = if i % 2 == 0 { "C" } else { "D" };
                    registry.open(class).unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let open: Vec<_> = store
            .sessions()
            .into_iter()
            .filter(|s| s.status == SessionStatus::Open)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(registry.current().unwrap().id, open[0].id);
    }
}
