//! Container runtime abstraction
//!
//! One capability set, three engines. Adapters normalize each engine's
//! quirks (mount relabelling, user namespaces, inspect JSON shapes)
//! behind this surface; the lifecycle manager never sees an engine
//! difference.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Container engine family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// OCI-style daemon (reference adapter)
    Docker,
    /// Rootless, daemonless engine
    Podman,
    /// macOS-native VM-per-container engine
    Apple,
}

/// Opaque handle to a managed container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Engine-assigned container id
    pub id: String,
    /// Host-assigned container name
    pub name: String,
    /// Engine that owns the container
    pub engine: Engine,
}

/// Normalized container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Created but not started
    Created,
    /// Start in progress
    Starting,
    /// Running
    Running,
    /// Stop in progress
    Stopping,
    /// Exited
    Stopped,
    /// Unrecoverable
    Dead,
}

/// Normalized inspect result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Lifecycle state
    pub state: ContainerState,
    /// Start time; absent when the engine reports its zero sentinel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Exit time; absent when the engine reports its zero sentinel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    /// Exit code, when exited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

/// Zero-value timestamp engines use for "never"
pub const ZERO_TIMESTAMP: &str = "0001-01-01T00:00:00Z";

/// Parse an engine timestamp, mapping the zero sentinel (and anything
/// unparseable) to absent
pub fn parse_engine_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Host-to-container volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path
    pub host: PathBuf,
    /// Container path
    pub container: PathBuf,
    /// Mount read-only
    pub read_only: bool,
}

/// Bind mount of a Unix-domain socket.
///
/// The macOS engine tunnels these over vsock but presents the same
/// shape: a host socket path appearing at a container path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMount {
    /// Host socket path
    pub host: PathBuf,
    /// Container socket path
    pub container: PathBuf,
}

/// TCP port mapping; binds to loopback unless told otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host bind address
    pub host_address: String,
    /// Host port
    pub host_port: u16,
    /// Container port
    pub container_port: u16,
}

impl PortMapping {
    /// Mapping bound to 127.0.0.1
    pub fn loopback(host_port: u16, container_port: u16) -> Self {
        Self {
            host_address: "127.0.0.1".to_string(),
            host_port,
            container_port,
        }
    }
}

/// Container network selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// No network (the default posture for agent containers)
    #[default]
    Disabled,
    /// A named engine network
    Named(String),
}

/// Normalized run options, identical across engines
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Image reference
    pub image: String,
    /// Container name; engine-assigned when absent
    pub name: Option<String>,
    /// Read-only root filesystem
    pub read_only: bool,
    /// Network selection
    pub network: NetworkMode,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// Unix-domain socket mounts
    pub socket_mounts: Vec<SocketMount>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// `uid:gid` to run as
    pub user: Option<String>,
    /// Entrypoint override
    pub entrypoint: Option<Vec<String>>,
    /// TCP port mappings
    pub port_mappings: Vec<PortMapping>,
    /// Data written to the container's stdin right after start.
    ///
    /// Used only for credential injection: the container is created and
    /// started with stdin attached (never detached-run), the bytes are
    /// written, and stdin is closed. Credentials never travel via env
    /// vars, image layers, or inspectable mounts.
    pub stdin_data: Option<Vec<u8>>,
}

/// Image build options
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Dockerfile path relative to the context; engine default if absent
    pub dockerfile: Option<PathBuf>,
    /// Tag for the built image
    pub tag: String,
    /// Build arguments
    pub build_args: HashMap<String, String>,
    /// Explicit DNS servers for build-time resolution (some engines
    /// cannot resolve registries without this)
    pub dns: Vec<String>,
}

/// The engine capability set.
///
/// All adapters implement exactly this surface; engine-specific flags
/// (`:Z` relabelling, `--userns=keep-id`, vsock socket tunnelling) are
/// internal to the adapter.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Which engine family this adapter drives
    fn engine(&self) -> Engine;

    /// Whether the engine is reachable
    async fn is_available(&self) -> bool;

    /// Engine version string
    async fn version(&self) -> Result<String>;

    /// Pull an image from its registry
    async fn pull(&self, image: &str) -> Result<()>;

    /// Whether an image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Load an image from a tarball
    async fn load_image(&self, tarball: &std::path::Path) -> Result<()>;

    /// Build an image; returns its digest/id
    async fn build(&self, opts: &BuildOptions) -> Result<String>;

    /// Labels of a local image
    async fn inspect_labels(&self, image: &str) -> Result<HashMap<String, String>>;

    /// Create and start a container
    async fn run(&self, opts: &RunOptions) -> Result<ContainerHandle>;

    /// Graceful stop, escalating engine-side after `timeout_secs`
    async fn stop(&self, handle: &ContainerHandle, timeout_secs: Option<u32>) -> Result<()>;

    /// Immediate kill
    async fn kill(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove the container and its anonymous volumes
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Normalized lifecycle state
    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timestamp_reports_absent() {
        assert_eq!(parse_engine_timestamp(ZERO_TIMESTAMP), None);
        assert_eq!(parse_engine_timestamp("0001-01-01T00:00:00.000000000Z"), None);
        assert_eq!(parse_engine_timestamp(""), None);
        assert_eq!(parse_engine_timestamp("garbage"), None);
        assert!(parse_engine_timestamp("2024-06-01T12:00:00Z").is_some());
        assert!(parse_engine_timestamp("2024-06-01T12:00:00.123456789+02:00").is_some());
    }

    #[test]
    fn test_port_mapping_defaults_to_loopback() {
        let mapping = PortMapping::loopback(8080, 80);
        assert_eq!(mapping.host_address, "127.0.0.1");
    }

    #[test]
    fn test_network_default_is_disabled() {
        assert_eq!(RunOptions::default().network, NetworkMode::Disabled);
    }
}
