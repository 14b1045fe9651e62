//! Resume-session store
//!
//! Group-scoped key/value store recording the latest live session id
//! per group, used by the `resume` session policy. SQLite-backed so it
//! survives restarts. Two hard rules: stored ids must be canonical
//! 8-4-4-4-12 hex UUIDs before they are ever handed out, and
//! TTL-expired rows are never returned.

use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS resume_sessions (
    grp        TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// Whether a string is a canonical lowercase-insensitive 8-4-4-4-12
/// hex UUID
pub fn is_canonical_uuid(candidate: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
            )
            .expect("uuid pattern compiles")
        })
        .is_match(candidate)
}

/// SQLite-backed latest-session store with TTL
pub struct ResumeStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl ResumeStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("failed to open {}: {}", path.display(), e)))?;
        Self::with_connection(conn, ttl)
    }

    /// In-memory store, used by tests
    pub fn open_in_memory(ttl: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("failed to open in-memory store: {}", e)))?;
        Self::with_connection(conn, ttl)
    }

    fn with_connection(conn: Connection, ttl: Duration) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Store(format!("failed to initialize schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    /// Record `session_id` as the latest session for `group`.
    ///
    /// Non-canonical ids are refused; nothing that is not a host-minted
    /// UUID belongs in this table.
    pub fn record(&self, group: &str, session_id: &str) -> Result<()> {
        if !is_canonical_uuid(session_id) {
            return Err(Error::Store(format!(
                "refusing to record non-canonical session id '{}'",
                session_id
            )));
        }
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO resume_sessions (grp, session_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(grp) DO UPDATE SET
                session_id = excluded.session_id,
                updated_at = excluded.updated_at",
            params![group, session_id, Utc::now().timestamp()],
        )
        .map_err(|e| Error::Store(format!("failed to record session: {}", e)))?;
        Ok(())
    }

    /// Latest recorded session for `group`, if fresh and well-formed.
    ///
    /// Expired rows are deleted on the way out; malformed rows (which
    /// only appear if the file was tampered with) are dropped with a
    /// warning and never returned.
    pub fn latest(&self, group: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store lock");
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT session_id, updated_at FROM resume_sessions WHERE grp = ?1",
                params![group],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Store(format!("failed to query session: {}", e)))?;

        let Some((session_id, updated_at)) = row else {
            return Ok(None);
        };

        let age = Utc::now().timestamp().saturating_sub(updated_at);
        if age > self.ttl.as_secs() as i64 {
            conn.execute(
                "DELETE FROM resume_sessions WHERE grp = ?1",
                params![group],
            )
            .map_err(|e| Error::Store(format!("failed to expire session: {}", e)))?;
            return Ok(None);
        }

        if !is_canonical_uuid(&session_id) {
            tracing::warn!(group, session_id = %session_id, "dropping malformed stored session id");
            conn.execute(
                "DELETE FROM resume_sessions WHERE grp = ?1",
                params![group],
            )
            .map_err(|e| Error::Store(format!("failed to drop malformed row: {}", e)))?;
            return Ok(None);
        }

        Ok(Some(session_id))
    }

    /// Forget the stored session for `group`
    pub fn forget(&self, group: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "DELETE FROM resume_sessions WHERE grp = ?1",
            params![group],
        )
        .map_err(|e| Error::Store(format!("failed to forget session: {}", e)))?;
        Ok(())
    }

    /// Delete every expired row; returns how many were removed
    pub fn prune(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("store lock");
        let cutoff = Utc::now().timestamp() - self.ttl.as_secs() as i64;
        let removed = conn
            .execute(
                "DELETE FROM resume_sessions WHERE updated_at < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::Store(format!("failed to prune: {}", e)))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRESH: Duration = Duration::from_secs(3600);

    #[test]
    fn test_uuid_validation() {
        assert!(is_canonical_uuid("6b29fc40-ca47-1067-b31d-00dd010662da"));
        assert!(is_canonical_uuid("6B29FC40-CA47-1067-B31D-00DD010662DA"));
        assert!(!is_canonical_uuid("6b29fc40ca471067b31d00dd010662da"));
        assert!(!is_canonical_uuid("not-a-uuid"));
        assert!(!is_canonical_uuid(""));
        assert!(!is_canonical_uuid(
            "6b29fc40-ca47-1067-b31d-00dd010662da-extra"
        ));
    }

    #[test]
    fn test_record_and_latest() {
        let store = ResumeStore::open_in_memory(FRESH).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        store.record("email", &id).unwrap();
        assert_eq!(store.latest("email").unwrap(), Some(id));
        assert_eq!(store.latest("slack").unwrap(), None);
    }

    #[test]
    fn test_record_replaces_previous() {
        let store = ResumeStore::open_in_memory(FRESH).unwrap();
        let first = uuid::Uuid::new_v4().to_string();
        let second = uuid::Uuid::new_v4().to_string();
        store.record("email", &first).unwrap();
        store.record("email", &second).unwrap();
        assert_eq!(store.latest("email").unwrap(), Some(second));
    }

    #[test]
    fn test_non_canonical_id_refused() {
        let store = ResumeStore::open_in_memory(FRESH).unwrap();
        assert!(store.record("email", "../../etc/passwd").is_err());
        assert!(store.record("email", "sess-123").is_err());
    }

    #[test]
    fn test_expired_rows_never_returned() {
        let store = ResumeStore::open_in_memory(Duration::from_secs(0)).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        store.record("email", &id).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.latest("email").unwrap(), None);
        // and the row is gone
        assert_eq!(store.latest("email").unwrap(), None);
    }

    #[test]
    fn test_tampered_row_dropped() {
        let store = ResumeStore::open_in_memory(FRESH).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO resume_sessions (grp, session_id, updated_at) VALUES (?1, ?2, ?3)",
                params!["email", "rm -rf /", Utc::now().timestamp()],
            )
            .unwrap();
        }
        assert_eq!(store.latest("email").unwrap(), None);
    }

    #[test]
    fn test_forget_and_prune() {
        let store = ResumeStore::open_in_memory(FRESH).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        store.record("email", &id).unwrap();
        store.forget("email").unwrap();
        assert_eq!(store.latest("email").unwrap(), None);

        // prune removes only stale rows
        store.record("email", &id).unwrap();
        assert_eq!(store.prune().unwrap(), 0);
    }
}
