//! rollcall-store: SQLite-backed attendance store.
//!
//! Classes, rosters, sessions and presence records live in one database
//! file. The one-open-session and one-presence-per-session invariants are
//! enforced by the schema itself, so every process writing to the file
//! (daemon and CLI) sees the same guarantees.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rollcall_core::{
    AttendanceStore, Identity, PresenceInsert, PresenceRecord, Session, SessionId, SessionStatus,
    StoreError,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS classes (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollments (
    class_id    TEXT NOT NULL REFERENCES classes(id) ON DELETE CASCADE,
    identity    TEXT NOT NULL,
    enrolled_at TEXT NOT NULL,
    PRIMARY KEY (class_id, identity)
);
CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    class_id    TEXT NOT NULL REFERENCES classes(id),
    status      TEXT NOT NULL CHECK (status IN ('open', 'closed')),
    opened_at   TEXT NOT NULL,
    closed_at   TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS sessions_single_open
    ON sessions(status) WHERE status = 'open';
CREATE TABLE IF NOT EXISTS presences (
    session_id  INTEGER NOT NULL REFERENCES sessions(id),
    identity    TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (session_id, identity)
);
";

/// A class and the size of its roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSummary {
    pub id: String,
    pub enrolled: usize,
}

/// Default database location: `$XDG_DATA_HOME/rollcall/attendance.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("attendance.db")
}

fn db_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Query(e.to_string()),
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(2)?;
    Ok(Session {
        id: row.get(0)?,
        class_id: row.get(1)?,
        status: if status == SessionStatus::Open.as_str() {
            SessionStatus::Open
        } else {
            SessionStatus::Closed
        },
        opened_at: row.get(3)?,
        closed_at: row.get(4)?,
    })
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;

        let version: i64 = conn
            .query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))
            .map_err(db_err)?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Query(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        conn.execute_batch(SCHEMA).map_err(db_err)?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(db_err)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a class. Returns `false` if it already existed.
    pub fn create_class(&self, class_id: &str) -> Result<bool, StoreError> {
        let class_id = class_id.trim();
        if class_id.is_empty() {
            return Err(StoreError::Query("class id must not be empty".to_string()));
        }
        let inserted = self
            .conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO classes (id, created_at) VALUES (?1, ?2)",
                params![class_id, Utc::now()],
            )
            .map_err(db_err)?;
        if inserted > 0 {
            tracing::info!(class_id, "class created");
        }
        Ok(inserted > 0)
    }

    /// Enroll a person in a class under the normalized form of `name`.
    ///
    /// Returns the identity that was stored.
    pub fn enroll(&self, class_id: &str, name: &str) -> Result<Identity, StoreError> {
        let identity = Identity::normalized(name);
        if identity.is_empty() {
            return Err(StoreError::Query(format!(
                "{name:?} has no characters usable in an identity"
            )));
        }
        if !self.class_exists(class_id)? {
            return Err(StoreError::Query(format!("unknown class {class_id:?}")));
        }
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO enrollments (class_id, identity, enrolled_at)
                 VALUES (?1, ?2, ?3)",
                params![class_id, identity.as_str(), Utc::now()],
            )
            .map_err(db_err)?;
        tracing::info!(class_id, identity = %identity, "enrolled");
        Ok(identity)
    }

    /// Remove `identity` from a class roster. Returns `false` if it was not enrolled.
    pub fn unenroll(&self, class_id: &str, identity: &Identity) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM enrollments WHERE class_id = ?1 AND identity = ?2",
                params![class_id, identity.as_str()],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    pub fn list_classes(&self) -> Result<Vec<ClassSummary>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, COUNT(e.identity)
                 FROM classes c LEFT JOIN enrollments e ON e.class_id = c.id
                 GROUP BY c.id ORDER BY c.id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ClassSummary {
                    id: row.get(0)?,
                    enrolled: row.get::<_, i64>(1)? as usize,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<_, _>>().map_err(db_err)
    }

    pub fn roster(&self, class_id: &str) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT identity FROM enrollments WHERE class_id = ?1 ORDER BY identity")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([class_id], |row| row.get::<_, String>(0).map(Identity::from))
            .map_err(db_err)?;
        rows.collect::<Result<_, _>>().map_err(db_err)
    }

    pub fn session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, class_id, status, opened_at, closed_at FROM sessions WHERE id = ?1",
                [id],
                session_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    /// Most recent sessions first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, class_id, status, opened_at, closed_at
                 FROM sessions ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([limit as i64], session_from_row)
            .map_err(db_err)?;
        rows.collect::<Result<_, _>>().map_err(db_err)
    }
}

impl AttendanceStore for SqliteStore {
    fn class_exists(&self, class_id: &str) -> Result<bool, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM classes WHERE id = ?1)",
                [class_id],
                |row| row.get(0),
            )
            .map_err(db_err)
    }

    fn is_class_member(&self, identity: &Identity, class_id: &str) -> Result<bool, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM enrollments WHERE class_id = ?1 AND identity = ?2)",
                params![class_id, identity.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)
    }

    fn insert_presence_if_absent(
        &self,
        session_id: SessionId,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<PresenceInsert, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match status.as_deref() {
            None => return Err(StoreError::Query(format!("no session {session_id}"))),
            Some(status) if status != SessionStatus::Open.as_str() => {
                return Ok(PresenceInsert::SessionClosed);
            }
            Some(_) => {}
        }
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO presences (session_id, identity, recorded_at)
                 VALUES (?1, ?2, ?3)",
                params![session_id, identity.as_str(), at],
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(if inserted > 0 {
            PresenceInsert::Inserted
        } else {
            PresenceInsert::AlreadyPresent
        })
    }

    fn open_session(&self, class_id: &str, at: DateTime<Utc>) -> Result<Session, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let closed = tx
            .execute(
                "UPDATE sessions SET status = 'closed', closed_at = ?1 WHERE status = 'open'",
                [at],
            )
            .map_err(db_err)?;
        tx.execute(
            "INSERT INTO sessions (class_id, status, opened_at) VALUES (?1, 'open', ?2)",
            params![class_id, at],
        )
        .map_err(db_err)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err)?;

        if closed > 0 {
            tracing::debug!(closed, "closed previous session");
        }
        Ok(Session {
            id,
            class_id: class_id.to_string(),
            status: SessionStatus::Open,
            opened_at: at,
            closed_at: None,
        })
    }

    fn close_open_sessions(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET status = 'closed', closed_at = ?1 WHERE status = 'open'",
                [at],
            )
            .map_err(db_err)
    }

    fn current_session(&self) -> Result<Option<Session>, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, class_id, status, opened_at, closed_at
                 FROM sessions WHERE status = 'open'",
                [],
                session_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    fn presences(&self, session_id: SessionId) -> Result<Vec<PresenceRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT identity, recorded_at FROM presences
                 WHERE session_id = ?1 ORDER BY recorded_at, identity",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([session_id], |row| {
                Ok(PresenceRecord {
                    session_id,
                    identity: Identity::from(row.get::<_, String>(0)?),
                    recorded_at: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<_, _>>().map_err(db_err)
    }
}
