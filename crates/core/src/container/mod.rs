//! Container lifecycle management
//!
//! Spawns a container per session, supervises its state, and
//! guarantees graceful-then-forceful teardown. Two invariants hold on
//! every path, including spawn failures and crashed containers: no
//! container outlives its session, and no session outlives its
//! container.

mod cli;

pub mod apple;
pub mod docker;
pub mod podman;
pub mod runtime;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::ConnectionIdentity;
use crate::session::{Session, SessionManager};
use self::runtime::{
    ContainerHandle, ContainerRuntime, ContainerState, ContainerStatus, RunOptions, SocketMount,
};

/// Container-side path at which the agent finds its host socket
pub const AGENT_SOCKET_PATH: &str = "/run/warden/agent.sock";

/// Env var carrying the host-minted connection identity (hex) that the
/// agent must install as its transport identity
pub const CONNECTION_IDENTITY_ENV: &str = "WARDEN_CONNECTION_IDENTITY";

/// Env var carrying the container-side socket path
pub const AGENT_SOCKET_ENV: &str = "WARDEN_AGENT_SOCKET";

/// Lifecycle manager tuning
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Host-side budget for a graceful stop before escalating to kill
    pub stop_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// A spawn request from the dispatcher or an operator
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Authorization compartment for the session
    pub group: String,
    /// Image to run
    pub image: String,
    /// Host path of the per-session socket to provision and mount
    pub socket_path: PathBuf,
    /// Extra environment for the agent
    pub env: HashMap<String, String>,
    /// Credential bytes injected over stdin at start, if any
    pub stdin_credentials: Option<Vec<u8>>,
}

/// A container under management, bound to its session
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    /// Engine handle
    pub handle: ContainerHandle,
    /// Owning session
    pub session_id: String,
    /// Provisioned host socket
    pub socket_path: PathBuf,
}

/// Owns every managed container and its pairing with a session
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<SessionManager>,
    managed: Mutex<HashMap<String, ManagedContainer>>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    /// Manager over an engine adapter and the session table
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<SessionManager>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            runtime,
            sessions,
            managed: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Spawn a container for a new session.
    ///
    /// Order: session mint (which mints the connection identity) →
    /// socket provisioning → engine run → registration. A failure at
    /// any step rolls back everything before it.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<ManagedContainer> {
        let container_name = format!(
            "warden-{}-{}",
            request.group,
            &Uuid::new_v4().simple().to_string()[..12]
        );
        let identity = ConnectionIdentity::mint();

        let session = self
            .sessions
            .create(&container_name, &request.group, identity.clone())?;

        if let Err(e) = self.provision_socket(&request.socket_path).await {
            self.sessions.remove(&session.session_id);
            return Err(e);
        }

        let mut env = request.env.clone();
        env.insert(CONNECTION_IDENTITY_ENV.to_string(), identity.to_hex());
        env.insert(
            AGENT_SOCKET_ENV.to_string(),
            AGENT_SOCKET_PATH.to_string(),
        );

        let opts = RunOptions {
            image: request.image.clone(),
            name: Some(container_name.clone()),
            read_only: true,
            socket_mounts: vec![SocketMount {
                host: request.socket_path.clone(),
                container: PathBuf::from(AGENT_SOCKET_PATH),
            }],
            env,
            stdin_data: request.stdin_credentials.clone(),
            ..Default::default()
        };

        let handle = match self.runtime.run(&opts).await {
            Ok(handle) => handle,
            Err(e) => {
                self.sessions.remove(&session.session_id);
                self.release_socket(&request.socket_path).await;
                return Err(e);
            }
        };

        let managed = ManagedContainer {
            handle,
            session_id: session.session_id.clone(),
            socket_path: request.socket_path,
        };
        self.managed
            .lock()
            .expect("managed lock")
            .insert(session.session_id.clone(), managed.clone());

        tracing::info!(
            session_id = %session.session_id,
            container = %managed.handle.name,
            group = %request.group,
            "container spawned"
        );
        Ok(managed)
    }

    /// The session owning a managed container, if both are live
    pub fn session_for(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }

    /// Managed container for a session, if any
    pub fn managed_for(&self, session_id: &str) -> Option<ManagedContainer> {
        self.managed
            .lock()
            .expect("managed lock")
            .get(session_id)
            .cloned()
    }

    /// Session ids of every managed container
    pub fn managed_sessions(&self) -> Vec<String> {
        self.managed
            .lock()
            .expect("managed lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Normalized status of a session's container
    pub async fn get_status(&self, session_id: &str) -> Result<ContainerStatus> {
        let managed = self
            .managed_for(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        self.runtime.inspect(&managed.handle).await
    }

    /// Tear a session down: graceful stop, then kill, then remove,
    /// always releasing the session and socket.
    ///
    /// Succeeds even when the container already crashed (`dead`) or the
    /// engine lost it; failures past the stop phase are logged and do
    /// not leak state.
    pub async fn shutdown(&self, session_id: &str) -> Result<()> {
        let managed = self
            .managed
            .lock()
            .expect("managed lock")
            .remove(session_id);

        let Some(managed) = managed else {
            // a session without a container still gets released
            self.sessions.remove(session_id);
            return Ok(());
        };

        let engine_grace = self.config.stop_timeout.as_secs().max(1) as u32;
        let stop = tokio::time::timeout(
            // host-side bound: engine grace plus headroom for the call
            self.config.stop_timeout + Duration::from_secs(2),
            self.runtime.stop(&managed.handle, Some(engine_grace)),
        )
        .await;

        match stop {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    container = %managed.handle.name,
                    error = %e,
                    "graceful stop failed, killing"
                );
                if let Err(e) = self.runtime.kill(&managed.handle).await {
                    tracing::warn!(container = %managed.handle.name, error = %e, "kill failed");
                }
            }
            Err(_) => {
                tracing::warn!(
                    container = %managed.handle.name,
                    "graceful stop timed out, killing"
                );
                if let Err(e) = self.runtime.kill(&managed.handle).await {
                    tracing::warn!(container = %managed.handle.name, error = %e, "kill failed");
                }
            }
        }

        if let Err(e) = self.runtime.remove(&managed.handle).await {
            tracing::warn!(container = %managed.handle.name, error = %e, "remove failed");
        }

        self.sessions.remove(session_id);
        self.release_socket(&managed.socket_path).await;

        tracing::info!(session_id, container = %managed.handle.name, "container shut down");
        Ok(())
    }

    /// Shut down every managed container concurrently and wait for all
    pub async fn shutdown_all(&self) -> Result<()> {
        let session_ids = self.managed_sessions();
        let results = futures::future::join_all(
            session_ids.iter().map(|id| self.shutdown(id)),
        )
        .await;
        for (session_id, result) in session_ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(session_id, error = %e, "shutdown failed");
            }
        }
        Ok(())
    }

    /// Whether a container is past recovery
    pub async fn is_dead(&self, session_id: &str) -> bool {
        matches!(
            self.get_status(session_id).await,
            Ok(ContainerStatus {
                state: ContainerState::Dead,
                ..
            })
        )
    }

    async fn provision_socket(&self, socket_path: &PathBuf) -> Result<()> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // stale socket files from a previous run would shadow the bind
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_socket(&self, socket_path: &PathBuf) {
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    socket = %socket_path.display(),
                    error = %e,
                    "failed to release socket"
                );
            }
        }
    }
}
