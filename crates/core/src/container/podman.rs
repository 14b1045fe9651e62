//! Rootless daemonless engine adapter
//!
//! CLI-driven. Engine deltas handled here: bind mounts carry the `:Z`
//! suffix for mandatory-access-control relabelling, containers run
//! with `--userns=keep-id`, and builds pass explicit `--dns` flags
//! (the build network cannot resolve registries otherwise).

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

const PODMAN: &str = "podman";

/// CLI adapter for the rootless engine
#[derive(Default)]
pub struct PodmanRuntime;

impl PodmanRuntime {
    /// New adapter (no connection state; every call is a CLI run)
    pub fn new() -> Self {
        Self
    }

    fn run_args(opts: &RunOptions, name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            // map the invoking user into the container user namespace
            "--userns=keep-id".to_string(),
        ];
        if opts.read_only {
            args.push("--read-only".to_string());
        }
        match &opts.network {
            NetworkMode::Disabled => args.push("--network=none".to_string()),
            NetworkMode::Named(net) => args.push(format!("--network={}", net)),
        }
        for volume in &opts.volumes {
            // :Z relabels for the engine's mandatory access control
            let mode = if volume.read_only { "ro,Z" } else { "Z" };
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}:{}",
                volume.host.display(),
                volume.container.display(),
                mode
            ));
        }
        for socket in &opts.socket_mounts {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}:Z",
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
            args.push("-p".to_string());
            args.push(format!(
                "{}:{}:{}",
                mapping.host_address, mapping.host_port, mapping.container_port
            ));
        }
        if opts.stdin_data.is_some() {
            args.push("--interactive".to_string());
        }
        if let Some(entrypoint) = &opts.entrypoint {
            // podman takes the entrypoint as a JSON array
            args.push("--entrypoint".to_string());
            args.push(serde_json::to_string(entrypoint).unwrap_or_default());
        }
        args.push(opts.image.clone());
        args
    }

    fn map_state(raw: &str) -> ContainerState {
        match raw {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "restarting" => ContainerState::Starting,
            "running" | "paused" => ContainerState::Running,
            "stopping" | "removing" => ContainerState::Stopping,
            "exited" | "stopped" => ContainerState::Stopped,
            _ => ContainerState::Dead,
        }
    }

    fn parse_inspect(raw: &str) -> Result<ContainerStatus> {
        let parsed: Value = serde_json::from_str(raw)?;
        let state = parsed
            .get(0)
            .and_then(|c| c.get("State"))
            .ok_or_else(|| Error::Runtime("inspect output missing State".to_string()))?;

        let status = state
            .get("Status")
            .and_then(Value::as_str)
            .unwrap_or("dead");
        Ok(ContainerStatus {
            state: Self::map_state(status),
            started_at: state
                .get("StartedAt")
                .and_then(Value::as_str)
                .and_then(parse_engine_timestamp),
            exited_at: state
                .get("FinishedAt")
                .and_then(Value::as_str)
                .and_then(parse_engine_timestamp),
            exit_code: state.get("ExitCode").and_then(Value::as_i64),
        })
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn engine(&self) -> Engine {
        Engine::Podman
    }

    async fn is_available(&self) -> bool {
        cli_succeeds(PODMAN, &["--version"]).await
    }

    async fn version(&self) -> Result<String> {
        let output = run_cli(PODMAN, &["version", "--format", "{{.Client.Version}}"]).await?;
        Ok(output.trim().to_string())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        run_cli(PODMAN, &["pull", image]).await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(cli_succeeds(PODMAN, &["image", "exists", image]).await)
    }

    async fn load_image(&self, tarball: &Path) -> Result<()> {
        let path = tarball.display().to_string();
        run_cli(PODMAN, &["load", "-i", &path]).await?;
        Ok(())
    }

    async fn build(&self, opts: &BuildOptions) -> Result<String> {
        let context = opts.context_dir.display().to_string();
        let mut args: Vec<String> = vec!["build".to_string(), "-t".to_string(), opts.tag.clone()];
        if let Some(dockerfile) = &opts.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.display().to_string());
        }
        // builds run in a network namespace with no resolver by default
        for dns in &opts.dns {
            args.push(format!("--dns={}", dns));
        }
        for (key, value) in &opts.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(context);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cli(PODMAN, &arg_refs).await?;

        let digest = run_cli(
            PODMAN,
            &["image", "inspect", "--format", "{{.Id}}", &opts.tag],
        )
        .await?;
        Ok(digest.trim().to_string())
    }

    async fn inspect_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        let raw = run_cli(PODMAN, &["image", "inspect", image]).await?;
        let parsed: Value = serde_json::from_str(&raw)?;
        let labels = parsed
            .get(0)
            .and_then(|i| i.get("Labels").or_else(|| i.pointer("/Config/Labels")))
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
        let created = run_cli(PODMAN, &arg_refs).await?;
        let id = created.trim().to_string();

        let handle = ContainerHandle {
            id,
            name: name.clone(),
            engine: Engine::Podman,
        };

        let start_result = match &opts.stdin_data {
            None => run_cli(PODMAN, &["start", &name]).await.map(|_| ()),
            Some(data) => start_attached(PODMAN, &name, data).await,
        };

        if let Err(e) = start_result {
            let _ = self.remove(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle, timeout_secs: Option<u32>) -> Result<()> {
        let timeout = timeout_secs.unwrap_or(10).to_string();
        run_cli(PODMAN, &["stop", "-t", &timeout, &handle.id]).await?;
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        run_cli(PODMAN, &["kill", &handle.id]).await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        run_cli(PODMAN, &["rm", "-f", "-v", &handle.id]).await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let raw = run_cli(PODMAN, &["container", "inspect", &handle.id]).await?;
        Self::parse_inspect(&raw)
    }
}
