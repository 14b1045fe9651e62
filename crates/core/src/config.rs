//! Supervisor configuration
//!
//! One TOML file, one struct. Every section has defaults so a missing
//! file section (or a missing file, for tests) still yields a runnable
//! configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::runtime::Engine;
use crate::dispatch::ResumeFallback;
use crate::error::{Error, Result};
use crate::protocol::MAX_FRAME_BYTES;
use crate::ratelimit::RateLimitConfig;

/// Transport endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Endpoint the ROUTER binds (e.g. `ipc:///run/warden/router.sock`)
    pub endpoint: String,
    /// Per-request deadline for unanswered requests
    pub request_timeout_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            endpoint: "ipc:///run/warden/router.sock".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Handler executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Handler deadline
    pub handler_deadline_ms: u64,
    /// Response size cap in bytes
    pub max_response_bytes: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            handler_deadline_ms: 35_000,
            max_response_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// Rate limiter settings: defaults plus per-group overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Default sustained rate
    pub requests_per_minute: f64,
    /// Default burst capacity
    pub burst_size: f64,
    /// Per-group overrides
    pub groups: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            requests_per_minute: defaults.requests_per_minute,
            burst_size: defaults.burst_size,
            groups: HashMap::new(),
        }
    }
}

impl RateLimitSection {
    /// Default bucket configuration
    pub fn default_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: self.requests_per_minute,
            burst_size: self.burst_size,
        }
    }
}

/// Audit log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Directory holding the per-group `.jsonl` files
    pub base_path: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/var/log/warden"),
        }
    }
}

/// Container lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    /// Engine adapter to use
    pub engine: Engine,
    /// Graceful stop budget before escalation
    pub stop_timeout_ms: u64,
    /// Directory for per-session sockets
    pub socket_dir: PathBuf,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            engine: Engine::Docker,
            stop_timeout_ms: 10_000,
            socket_dir: PathBuf::from("/run/warden"),
        }
    }
}

/// Event dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Allowed event topic prefix
    pub allowed_topic_prefix: String,
    /// `resume` fallback when nothing is live
    pub resume_fallback: ResumeFallback,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            allowed_topic_prefix: "event.".to_string(),
            resume_fallback: ResumeFallback::Fresh,
        }
    }
}

/// Resume-session store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite file path
    pub path: PathBuf,
    /// Row time-to-live in seconds
    pub ttl_seconds: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/warden/resume.db"),
            ttl_seconds: 86_400,
        }
    }
}

/// Complete supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Transport endpoint
    pub transport: TransportSection,
    /// Executor bounds
    pub executor: ExecutorSection,
    /// Rate limits
    pub ratelimit: RateLimitSection,
    /// Audit log
    pub audit: AuditSection,
    /// Container lifecycle
    pub lifecycle: LifecycleSection,
    /// Event dispatch
    pub dispatch: DispatchSection,
    /// Resume-session store
    pub store: StoreSection,
}

impl SupervisorConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SupervisorConfig = toml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation
    pub fn validate(&self) -> Result<()> {
        self.ratelimit.default_config().validate()?;
        for (group, config) in &self.ratelimit.groups {
            config.validate().map_err(|e| {
                Error::InvalidConfig(format!("ratelimit.groups.{}: {}", group, e))
            })?;
        }
        if self.executor.handler_deadline_ms == 0 {
            return Err(Error::InvalidConfig(
                "executor.handler_deadline_ms must be > 0".to_string(),
            ));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "transport.request_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Handler deadline as a duration
    pub fn handler_deadline(&self) -> Duration {
        Duration::from_millis(self.executor.handler_deadline_ms)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.request_timeout_ms)
    }

    /// Stop timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle.stop_timeout_ms)
    }

    /// Store TTL as a duration
    pub fn store_ttl(&self) -> Duration {
        Duration::from_secs(self.store.ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.max_response_bytes, MAX_FRAME_BYTES);
        assert_eq!(config.handler_deadline(), Duration::from_secs(35));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [transport]
            endpoint = "ipc:///tmp/test.sock"

            [ratelimit]
            requests_per_minute = 120.0

            [ratelimit.groups.slack]
            requests_per_minute = 30.0
            burst_size = 2.0
        "#;
        let config: SupervisorConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.transport.endpoint, "ipc:///tmp/test.sock");
        assert_eq!(config.transport.request_timeout_ms, 30_000);
        assert_eq!(config.ratelimit.requests_per_minute, 120.0);
        assert_eq!(config.ratelimit.groups["slack"].burst_size, 2.0);
        assert_eq!(config.lifecycle.engine, Engine::Docker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_group_limit_rejected() {
        let raw = r#"
            [ratelimit.groups.slack]
            requests_per_minute = 0.0
            burst_size = 2.0
        "#;
        let config: SupervisorConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(
            &path,
            r#"
            [lifecycle]
            engine = "podman"
            stop_timeout_ms = 500
            "#,
        )
        .unwrap();

        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.lifecycle.engine, Engine::Podman);
        assert_eq!(config.stop_timeout(), Duration::from_millis(500));

        assert!(SupervisorConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
