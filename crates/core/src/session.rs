//! Session minting and lookup
//!
//! A session is a host-minted, container-bound authority scope. The
//! manager maintains three mappings (`sessionId`, `connectionIdentity`,
//! `containerId`) under one lock so no operation can leave them out of
//! step, and both secondary keys are unique.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::ConnectionIdentity;

/// Host-owned session state
#[derive(Debug, Clone)]
pub struct Session {
    /// Host-minted opaque id (canonical UUID)
    pub session_id: String,
    /// Authorization compartment
    pub group: String,
    /// Container identifier, used as the audit/source tag
    pub container_id: String,
    /// Transport identity used to route replies
    pub connection_identity: ConnectionIdentity,
    /// Mint time
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// View in the shape the pipeline consumes
    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.session_id.clone(),
            group: self.group.clone(),
            source: self.container_id.clone(),
            connection_identity: self.connection_identity.clone(),
            started_at: self.started_at,
        }
    }
}

/// Trusted session view handed to the validation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Host-minted session id
    pub session_id: String,
    /// Authorization compartment
    pub group: String,
    /// Audit/source tag (the container id)
    pub source: String,
    /// Transport identity for routing replies
    pub connection_identity: ConnectionIdentity,
    /// Session mint time
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionMaps {
    by_id: HashMap<String, Session>,
    by_identity: HashMap<ConnectionIdentity, String>,
    by_container: HashMap<String, String>,
}

/// Mints, looks up, and releases sessions
#[derive(Default)]
pub struct SessionManager {
    maps: Mutex<SessionMaps>,
}

impl SessionManager {
    /// Empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a session for a new container.
    ///
    /// Fails if either the connection identity or the container id is
    /// already bound; on success all three mappings are installed
    /// atomically.
    pub fn create(
        &self,
        container_id: &str,
        group: &str,
        connection_identity: ConnectionIdentity,
    ) -> Result<Session> {
        let mut maps = self.maps.lock().expect("session lock");

        if let Some(existing) = maps.by_identity.get(&connection_identity) {
            return Err(Error::DuplicateIdentity(existing.clone()));
        }
        if maps.by_container.contains_key(container_id) {
            return Err(Error::DuplicateContainer(container_id.to_string()));
        }

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            group: group.to_string(),
            container_id: container_id.to_string(),
            connection_identity: connection_identity.clone(),
            started_at: Utc::now(),
        };

        maps.by_identity
            .insert(connection_identity, session.session_id.clone());
        maps.by_container
            .insert(container_id.to_string(), session.session_id.clone());
        maps.by_id
            .insert(session.session_id.clone(), session.clone());

        tracing::info!(
            session_id = %session.session_id,
            group,
            container_id,
            "session created"
        );
        Ok(session)
    }

    /// Look up by session id
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.maps
            .lock()
            .expect("session lock")
            .by_id
            .get(session_id)
            .cloned()
    }

    /// Look up by transport identity
    pub fn get_by_connection_identity(&self, identity: &ConnectionIdentity) -> Option<Session> {
        let maps = self.maps.lock().expect("session lock");
        maps.by_identity
            .get(identity)
            .and_then(|id| maps.by_id.get(id))
            .cloned()
    }

    /// Look up by container id
    pub fn get_by_container_id(&self, container_id: &str) -> Option<Session> {
        let maps = self.maps.lock().expect("session lock");
        maps.by_container
            .get(container_id)
            .and_then(|id| maps.by_id.get(id))
            .cloned()
    }

    /// Remove a session and both secondary mappings atomically.
    ///
    /// Returns whether a session was present.
    pub fn remove(&self, session_id: &str) -> bool {
        let mut maps = self.maps.lock().expect("session lock");
        match maps.by_id.remove(session_id) {
            Some(session) => {
                maps.by_identity.remove(&session.connection_identity);
                maps.by_container.remove(&session.container_id);
                tracing::info!(session_id, "session released");
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live sessions
    pub fn all(&self) -> Vec<Session> {
        self.maps
            .lock()
            .expect("session lock")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    /// Live sessions in one group, as pipeline-shaped contexts
    pub fn contexts_in_group(&self, group: &str) -> Vec<SessionContext> {
        self.maps
            .lock()
            .expect("session lock")
            .by_id
            .values()
            .filter(|s| s.group == group)
            .map(Session::context)
            .collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.maps.lock().expect("session lock").by_id.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session
    pub fn cleanup(&self) {
        let mut maps = self.maps.lock().expect("session lock");
        maps.by_id.clear();
        maps.by_identity.clear();
        maps.by_container.clear();
    }

    /// Pipeline view of a session, if present
    pub fn to_context(&self, session_id: &str) -> Option<SessionContext> {
        self.get(session_id).map(|s| s.context())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(tag: &[u8]) -> ConnectionIdentity {
        ConnectionIdentity::new(tag.to_vec())
    }

    #[test]
    fn test_create_and_lookup() {
        let manager = SessionManager::new();
        let session = manager
            .create("ctr-1", "email", identity(b"id-1"))
            .unwrap();

        assert_eq!(manager.get(&session.session_id).unwrap().group, "email");
        assert_eq!(
            manager
                .get_by_connection_identity(&identity(b"id-1"))
                .unwrap()
                .session_id,
            session.session_id
        );
        assert_eq!(
            manager
                .get_by_container_id("ctr-1")
                .unwrap()
                .session_id,
            session.session_id
        );
        assert!(manager.get("nope").is_none());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let manager = SessionManager::new();
        manager.create("ctr-1", "email", identity(b"id-1")).unwrap();
        let err = manager
            .create("ctr-2", "email", identity(b"id-1"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(_)));
        // the failed create left no partial state
        assert!(manager.get_by_container_id("ctr-2").is_none());
    }

    #[test]
    fn test_duplicate_container_rejected() {
        let manager = SessionManager::new();
        manager.create("ctr-1", "email", identity(b"id-1")).unwrap();
        let err = manager
            .create("ctr-1", "slack", identity(b"id-2"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateContainer(_)));
        assert!(manager
            .get_by_connection_identity(&identity(b"id-2"))
            .is_none());
    }

    #[test]
    fn test_remove_clears_all_three_maps() {
        let manager = SessionManager::new();
        let session = manager
            .create("ctr-1", "email", identity(b"id-1"))
            .unwrap();

        assert!(manager.remove(&session.session_id));
        assert!(manager.get(&session.session_id).is_none());
        assert!(manager
            .get_by_connection_identity(&identity(b"id-1"))
            .is_none());
        assert!(manager.get_by_container_id("ctr-1").is_none());

        // keys are reusable after release
        assert!(manager.create("ctr-1", "email", identity(b"id-1")).is_ok());
        // removing twice reports absence
        assert!(!manager.remove(&session.session_id));
    }

    #[test]
    fn test_context_view() {
        let manager = SessionManager::new();
        let session = manager
            .create("ctr-9", "slack", identity(b"id-9"))
            .unwrap();
        let ctx = manager.to_context(&session.session_id).unwrap();
        assert_eq!(ctx.source, "ctr-9");
        assert_eq!(ctx.group, "slack");
        assert_eq!(ctx.session_id, session.session_id);
    }

    #[test]
    fn test_group_enumeration_and_cleanup() {
        let manager = SessionManager::new();
        manager.create("c1", "email", identity(b"i1")).unwrap();
        manager.create("c2", "email", identity(b"i2")).unwrap();
        manager.create("c3", "slack", identity(b"i3")).unwrap();

        assert_eq!(manager.len(), 3);
        assert_eq!(manager.contexts_in_group("email").len(), 2);
        assert_eq!(manager.contexts_in_group("slack").len(), 1);

        manager.cleanup();
        assert!(manager.is_empty());
        assert!(manager.get_by_container_id("c1").is_none());
    }
}
