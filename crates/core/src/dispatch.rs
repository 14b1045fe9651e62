//! Event dispatcher
//!
//! Turns externally published events into container spawns according
//! to each group's declared session policy. The hard rule throughout:
//! the only session id that can ever reach a container is one minted
//! by this host. Session ids found in wire payloads are ignored on
//! every policy path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::container::{LifecycleManager, SpawnRequest};
use crate::error::Result;
use crate::session::SessionManager;
use crate::store::ResumeStore;
use crate::tools::ToolHandler;

/// Env var through which a resumed session id reaches the agent
pub const RESUME_SESSION_ENV: &str = "WARDEN_RESUME_SESSION";

/// How a group's handler wants event-triggered sessions managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Always start a new container
    #[default]
    Fresh,
    /// Resume the latest live session when one exists, else fresh
    Resume,
    /// Ask the handler's `resolve_session`
    Explicit,
}

/// What `resume` does when no live session exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeFallback {
    /// Spawn a fresh container
    #[default]
    Fresh,
    /// Drop the event
    Drop,
}

/// Per-group spawn declaration from the handler manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupManifest {
    /// Authorization compartment
    pub group: String,
    /// Image to spawn for this group
    pub image: String,
    /// Session policy
    #[serde(default)]
    pub session_policy: SessionPolicy,
    /// Cap on concurrently live sessions in this group
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_sessions() -> usize {
    4
}

/// An externally published event naming a group.
///
/// `session_id` is deserialized so the field survives round-trips, but
/// no policy ever reads it: wire payloads cannot influence which
/// session reaches a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    /// Event topic
    pub topic: String,
    /// Target group
    pub group: String,
    /// Event payload
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Wire-supplied session id — always ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Why an event did not spawn a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Topic outside the allowed event namespace
    TopicOutsideNamespace,
    /// No manifest registered for the group
    UnknownGroup,
    /// Group is at its `max_sessions` cap
    SessionCapReached,
    /// `resolve_session` failed (dispatcher error, logged)
    ResolverError,
    /// `resume` found no live session and fallback is `drop`
    ResumeUnavailable,
}

/// Dispatch outcome
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// A container was spawned
    Spawned {
        /// The freshly minted session
        session_id: String,
        /// Live session id injected for resumption, if any
        resumed_from: Option<String>,
    },
    /// The event was dropped
    Dropped(DropReason),
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Allowed event topic prefix (`response.*` is never a trigger)
    pub allowed_topic_prefix: String,
    /// Fallback when `resume` finds nothing live
    pub resume_fallback: ResumeFallback,
    /// Directory for per-session sockets
    pub socket_dir: PathBuf,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            allowed_topic_prefix: "event.".to_string(),
            resume_fallback: ResumeFallback::Fresh,
            socket_dir: PathBuf::from("/run/warden"),
        }
    }
}

/// Resolves session policy and spawns containers for events
pub struct EventDispatcher {
    manifests: RwLock<HashMap<String, GroupManifest>>,
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionManager>,
    store: Arc<ResumeStore>,
    config: DispatcherConfig,
}

impl EventDispatcher {
    /// Dispatcher over the lifecycle manager, session table, and
    /// resume store
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<SessionManager>,
        store: Arc<ResumeStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            manifests: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            lifecycle,
            sessions,
            store,
            config,
        }
    }

    /// Register a group manifest, optionally with the handler whose
    /// `resolve_session` serves the `explicit` policy
    pub fn register_group(
        &self,
        manifest: GroupManifest,
        handler: Option<Arc<dyn ToolHandler>>,
    ) {
        let group = manifest.group.clone();
        self.manifests
            .write()
            .expect("manifest lock")
            .insert(group.clone(), manifest);
        if let Some(handler) = handler {
            self.handlers
                .write()
                .expect("handler lock")
                .insert(group, handler);
        }
    }

    /// Decide and act on one event
    pub async fn dispatch(&self, event: &EventMessage) -> Result<DispatchOutcome> {
        if !event.topic.starts_with(&self.config.allowed_topic_prefix) {
            tracing::debug!(topic = %event.topic, "event topic outside namespace, dropped");
            return Ok(DispatchOutcome::Dropped(DropReason::TopicOutsideNamespace));
        }

        let manifest = match self
            .manifests
            .read()
            .expect("manifest lock")
            .get(&event.group)
            .cloned()
        {
            Some(manifest) => manifest,
            None => {
                tracing::warn!(group = %event.group, "event for unknown group dropped");
                return Ok(DispatchOutcome::Dropped(DropReason::UnknownGroup));
            }
        };

        let live = self.sessions.contexts_in_group(&event.group).len();
        if live >= manifest.max_sessions {
            tracing::warn!(
                group = %event.group,
                live,
                cap = manifest.max_sessions,
                "session cap reached, event dropped"
            );
            return Ok(DispatchOutcome::Dropped(DropReason::SessionCapReached));
        }

        let resumed_from = match manifest.session_policy {
            SessionPolicy::Fresh => None,
            SessionPolicy::Resume => match self.resolve_resume(&event.group)? {
                Some(id) => Some(id),
                None => match self.config.resume_fallback {
                    ResumeFallback::Fresh => None,
                    ResumeFallback::Drop => {
                        tracing::debug!(group = %event.group, "no live session to resume, dropped");
                        return Ok(DispatchOutcome::Dropped(DropReason::ResumeUnavailable));
                    }
                },
            },
            SessionPolicy::Explicit => match self.resolve_explicit(event).await {
                Ok(resolved) => resolved,
                Err(reason) => return Ok(DispatchOutcome::Dropped(reason)),
            },
        };

        let mut env = HashMap::new();
        if let Some(id) = &resumed_from {
            env.insert(RESUME_SESSION_ENV.to_string(), id.clone());
        }

        let socket_path = self
            .config
            .socket_dir
            .join(format!("{}-{}.sock", event.group, Uuid::new_v4().simple()));

        let managed = self
            .lifecycle
            .spawn(SpawnRequest {
                group: event.group.clone(),
                image: manifest.image.clone(),
                socket_path,
                env,
                stdin_credentials: None,
            })
            .await?;

        // the fresh session becomes the group's latest for `resume`
        if let Err(e) = self.store.record(&event.group, &managed.session_id) {
            tracing::warn!(group = %event.group, error = %e, "failed to record resume session");
        }

        Ok(DispatchOutcome::Spawned {
            session_id: managed.session_id,
            resumed_from,
        })
    }

    /// Host-owned "latest live session" lookup: the stored id counts
    /// only if the session table still knows it
    fn resolve_resume(&self, group: &str) -> Result<Option<String>> {
        match self.store.latest(group)? {
            Some(id) if self.sessions.get(&id).is_some() => Ok(Some(id)),
            Some(stale) => {
                tracing::debug!(group, session_id = %stale, "stored session no longer live");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn resolve_explicit(
        &self,
        event: &EventMessage,
    ) -> std::result::Result<Option<String>, DropReason> {
        let handler = match self
            .handlers
            .read()
            .expect("handler lock")
            .get(&event.group)
            .cloned()
        {
            Some(handler) => handler,
            None => {
                tracing::error!(
                    group = %event.group,
                    "explicit session policy but no handler registered"
                );
                return Err(DropReason::ResolverError);
            }
        };

        let sessions = self.sessions.contexts_in_group(&event.group);
        match handler.resolve_session(event, &sessions).await {
            Ok(Some(id)) => {
                // only host-minted, currently live ids are injectable
                if self.sessions.get(&id).is_some() {
                    Ok(Some(id))
                } else {
                    tracing::error!(
                        group = %event.group,
                        session_id = %id,
                        "resolver returned a session this host does not own"
                    );
                    Err(DropReason::ResolverError)
                }
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::error!(group = %event.group, error = %e, "resolve_session failed");
                Err(DropReason::ResolverError)
            }
        }
    }
}
