//! macOS-native VM-per-container engine adapter
//!
//! Each container runs inside its own lightweight VM. Socket mounts
//! are tunnelled over vsock by the engine but keep the normalized
//! host-path/container-path shape, so callers cannot tell the
//! difference. Two more deltas live here: the VM rootfs is read-only
//! unless explicitly made writable, and the inspect output uses this
//! engine's own JSON shape (a lowercase `status` string beside a
//! `configuration` object) rather than the daemon's `State` block.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::container::cli::{cli_succeeds, run_cli, start_attached};
use crate::container::runtime::{
    parse_engine_timestamp, BuildOptions, ContainerHandle, ContainerRuntime, ContainerState,
    ContainerStatus, Engine, NetworkMode, RunOptions,
};
use crate::error::{Error, Result};

const CONTAINER: &str = "container";

/// CLI adapter for the macOS VM-per-container engine
#[derive(Default)]
pub struct AppleContainerRuntime;

impl AppleContainerRuntime {
    /// New adapter
    pub fn new() -> Self {
        Self
    }

    fn run_args(opts: &RunOptions, name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        // the VM rootfs is read-only by default; only opting out needs
        // a flag
        if !opts.read_only {
            args.push("--rootfs-writable".to_string());
        }
        if let NetworkMode::Named(net) = &opts.network {
            args.push("--network".to_string());
            args.push(net.clone());
        }
        // VM isolation means "no network" is the absence of a network
        // attachment; nothing to pass for Disabled.
        for volume in &opts.volumes {
            args.push("--volume".to_string());
            if volume.read_only {
                args.push(format!(
                    "{}:{}:ro",
                    volume.host.display(),
                    volume.container.display()
                ));
            } else {
                args.push(format!(
                    "{}:{}",
                    volume.host.display(),
                    volume.container.display()
                ));
            }
        }
        // socket mounts: same shape as bind mounts; the engine bridges
        // the host socket into the VM over vsock
        for socket in &opts.socket_mounts {
            args.push("--volume".to_string());
            args.push(format!(
                "{}:{}",
                socket.host.display(),
                socket.container.display()
            ));
        }
        for (key, value) in &opts.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(user) = &opts.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        for mapping in &opts.port_mappings {
            args.push("--publish".to_string());
            args.push(format!(
                "{}:{}:{}",
                mapping.host_address, mapping.host_port, mapping.container_port
            ));
        }
        if opts.stdin_data.is_some() {
            args.push("--interactive".to_string());
        }
        if let Some(entrypoint) = &opts.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.join(" "));
        }
        args.push(opts.image.clone());
        args
    }

    fn map_state(raw: &str) -> ContainerState {
        match raw {
            "created" => ContainerState::Created,
            "starting" => ContainerState::Starting,
            "running" => ContainerState::Running,
            "stopping" => ContainerState::Stopping,
            "stopped" | "exited" => ContainerState::Stopped,
            _ => ContainerState::Dead,
        }
    }

    fn parse_inspect(raw: &str) -> Result<ContainerStatus> {
        let parsed: Value = serde_json::from_str(raw)?;
        let entry = parsed
            .get(0)
            .ok_or_else(|| Error::Runtime("inspect output is empty".to_string()))?;

        let status = entry
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("stopped");
        Ok(ContainerStatus {
            state: Self::map_state(status),
            started_at: entry
                .get("startedAt")
                .and_then(Value::as_str)
                .and_then(parse_engine_timestamp),
            exited_at: entry
                .get("exitedAt")
                .and_then(Value::as_str)
                .and_then(parse_engine_timestamp),
            exit_code: entry.get("exitCode").and_then(Value::as_i64),
        })
    }
}

#[async_trait]
impl ContainerRuntime for AppleContainerRuntime {
    fn engine(&self) -> Engine {
        Engine::Apple
    }

    async fn is_available(&self) -> bool {
        cli_succeeds(CONTAINER, &["system", "status"]).await
    }

    async fn version(&self) -> Result<String> {
        let output = run_cli(CONTAINER, &["--version"]).await?;
        Ok(output.trim().to_string())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        run_cli(CONTAINER, &["image", "pull", image]).await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(cli_succeeds(CONTAINER, &["image", "inspect", image]).await)
    }

    async fn load_image(&self, tarball: &Path) -> Result<()> {
        let path = tarball.display().to_string();
        run_cli(CONTAINER, &["image", "load", "--input", &path]).await?;
        Ok(())
    }

    async fn build(&self, opts: &BuildOptions) -> Result<String> {
        let context = opts.context_dir.display().to_string();
        let mut args: Vec<String> = vec![
            "build".to_string(),
            "--tag".to_string(),
            opts.tag.clone(),
        ];
        if let Some(dockerfile) = &opts.dockerfile {
            args.push("--file".to_string());
            args.push(dockerfile.display().to_string());
        }
        for (key, value) in &opts.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(context);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cli(CONTAINER, &arg_refs).await?;

        let raw = run_cli(CONTAINER, &["image", "inspect", &opts.tag]).await?;
        let parsed: Value = serde_json::from_str(&raw)?;
        parsed
            .get(0)
            .and_then(|i| i.get("digest").or_else(|| i.get("id")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Runtime(format!("built image '{}' has no digest", opts.tag)))
    }

    async fn inspect_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        let raw = run_cli(CONTAINER, &["image", "inspect", image]).await?;
        let parsed: Value = serde_json::from_str(&raw)?;
        let labels = parsed
            .get(0)
            .and_then(|i| i.pointer("/config/Labels").or_else(|| i.get("labels")))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(labels).unwrap_or_default())
    }

    async fn run(&self, opts: &RunOptions) -> Result<ContainerHandle> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("warden-{}", uuid::Uuid::new_v4().simple()));

        let args = Self::run_args(opts, &name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cli(CONTAINER, &arg_refs).await?;

        let handle = ContainerHandle {
            // this engine addresses containers by name
            id: name.clone(),
            name,
            engine: Engine::Apple,
        };

        if let Err(e) = match &opts.stdin_data {
            None => run_cli(CONTAINER, &["start", &handle.name]).await.map(|_| ()),
            Some(data) => start_attached(CONTAINER, &handle.name, data).await,
        } {
            let _ = self.remove(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle, timeout_secs: Option<u32>) -> Result<()> {
        let timeout = timeout_secs.unwrap_or(10).to_string();
        run_cli(CONTAINER, &["stop", "--time", &timeout, &handle.name]).await?;
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        run_cli(CONTAINER, &["kill", &handle.name]).await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        run_cli(CONTAINER, &["delete", "--force", &handle.name]).await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let raw = run_cli(CONTAINER, &["inspect", &handle.name]).await?;
        Self::parse_inspect(&raw)
    }
}
