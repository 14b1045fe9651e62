//! OCI daemon adapter (reference engine)
//!
//! Drives the standard container daemon over its local socket using
//! bollard. Credential stdin injection uses create + attach + start,
//! never a detached run, so secret bytes exist only on the attached
//! stream.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, ImportImageOptions};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;

use crate::container::runtime::{
    parse_engine_timestamp, BuildOptions, ContainerHandle, ContainerRuntime, ContainerState,
    ContainerStatus, Engine, NetworkMode, RunOptions,
};
use crate::error::{Error, Result};

/// Bollard-backed adapter for the OCI daemon
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with the daemon's local defaults (socket or env)
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Runtime(format!("failed to connect to container daemon: {}", e)))?;
        Ok(Self { docker })
    }

    fn binds(opts: &RunOptions) -> Option<Vec<String>> {
        let mut binds: Vec<String> = opts
            .volumes
            .iter()
            .map(|v| {
                if v.read_only {
                    format!("{}:{}:ro", v.host.display(), v.container.display())
                } else {
                    format!("{}:{}", v.host.display(), v.container.display())
                }
            })
            .collect();
        // socket mounts need write access for connect()
        binds.extend(
            opts.socket_mounts
                .iter()
                .map(|s| format!("{}:{}", s.host.display(), s.container.display())),
        );
        if binds.is_empty() {
            None
        } else {
            Some(binds)
        }
    }

    fn port_bindings(
        opts: &RunOptions,
    ) -> Option<HashMap<String, Option<Vec<PortBinding>>>> {
        if opts.port_mappings.is_empty() {
            return None;
        }
        let mut bindings = HashMap::new();
        for mapping in &opts.port_mappings {
            bindings.insert(
                format!("{}/tcp", mapping.container_port),
                Some(vec![PortBinding {
                    host_ip: Some(mapping.host_address.clone()),
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }
        Some(bindings)
    }

    fn map_status(
        status: Option<ContainerStateStatusEnum>,
        started_at: Option<String>,
        finished_at: Option<String>,
        exit_code: Option<i64>,
    ) -> ContainerStatus {
        let state = match status {
            Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::EMPTY) => {
                ContainerState::Created
            }
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Starting,
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Running,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Stopping,
            Some(ContainerStateStatusEnum::EXITED) => ContainerState::Stopped,
            Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
            None => ContainerState::Created,
        };
        ContainerStatus {
            state,
            started_at: started_at.as_deref().and_then(parse_engine_timestamp),
            exited_at: finished_at.as_deref().and_then(parse_engine_timestamp),
            exit_code,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn engine(&self) -> Engine {
        Engine::Docker
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn version(&self) -> Result<String> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| Error::Runtime(format!("version query failed: {}", e)))?;
        Ok(version.version.unwrap_or_default())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::Runtime(format!("failed to pull '{}': {}", image, e)))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::Runtime(format!(
                "failed to inspect image '{}': {}",
                image, e
            ))),
        }
    }

    async fn load_image(&self, tarball: &Path) -> Result<()> {
        let contents = tokio::fs::read(tarball).await?;
        self.docker
            .import_image(
                ImportImageOptions {
                    quiet: true,
                    ..Default::default()
                },
                bollard::body_full(contents.into()),
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                Error::Runtime(format!(
                    "failed to load image from {}: {}",
                    tarball.display(),
                    e
                ))
            })?;
        Ok(())
    }

    async fn build(&self, opts: &BuildOptions) -> Result<String> {
        // the daemon wants the context as a tar stream
        let context = {
            let mut builder = tar::Builder::new(Vec::new());
            builder
                .append_dir_all(".", &opts.context_dir)
                .map_err(|e| Error::Runtime(format!("failed to tar build context: {}", e)))?;
            builder
                .into_inner()
                .map_err(|e| Error::Runtime(format!("failed to finish build context: {}", e)))?
        };

        let dockerfile = opts
            .dockerfile
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "Dockerfile".to_string());

        self.docker
            .build_image(
                BuildImageOptions {
                    dockerfile,
                    t: opts.tag.clone(),
                    buildargs: opts.build_args.clone(),
                    ..Default::default()
                },
                None,
                Some(bollard::body_full(context.into())),
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::Runtime(format!("build of '{}' failed: {}", opts.tag, e)))?;

        let inspect = self
            .docker
            .inspect_image(&opts.tag)
            .await
            .map_err(|e| Error::Runtime(format!("built image '{}' not found: {}", opts.tag, e)))?;
        inspect
            .id
            .ok_or_else(|| Error::Runtime(format!("built image '{}' has no id", opts.tag)))
    }

    async fn inspect_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| Error::Runtime(format!("failed to inspect '{}': {}", image, e)))?;
        Ok(inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default())
    }

    async fn run(&self, opts: &RunOptions) -> Result<ContainerHandle> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("warden-{}", uuid::Uuid::new_v4().simple()));

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let network_mode = match &opts.network {
            NetworkMode::Disabled => "none".to_string(),
            NetworkMode::Named(name) => name.clone(),
        };

        let attach_stdin = opts.stdin_data.is_some();
        let config = Config {
            image: Some(opts.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            entrypoint: opts.entrypoint.clone(),
            user: opts.user.clone(),
            attach_stdin: Some(attach_stdin),
            open_stdin: Some(attach_stdin),
            stdin_once: Some(attach_stdin),
            host_config: Some(HostConfig {
                binds: Self::binds(opts),
                network_mode: Some(network_mode),
                readonly_rootfs: Some(opts.read_only),
                port_bindings: Self::port_bindings(opts),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::Runtime(format!("failed to create '{}': {}", name, e)))?;

        let handle = ContainerHandle {
            id: created.id.clone(),
            name,
            engine: Engine::Docker,
        };

        // attach before start so no early output (or stdin window) is lost
        let attached = if let Some(data) = &opts.stdin_data {
            let results = self
                .docker
                .attach_container(
                    &handle.id,
                    Some(AttachContainerOptions::<String> {
                        stdin: Some(true),
                        stream: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| Error::Runtime(format!("failed to attach stdin: {}", e)))?;
            Some((results.input, data.clone()))
        } else {
            None
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
        {
            // leave no half-started container behind
            let _ = self.remove(&handle).await;
            return Err(Error::Runtime(format!(
                "failed to start '{}': {}",
                handle.name, e
            )));
        }

        if let Some((mut input, data)) = attached {
            input
                .write_all(&data)
                .await
                .map_err(|e| Error::Runtime(format!("credential injection failed: {}", e)))?;
            input
                .shutdown()
                .await
                .map_err(|e| Error::Runtime(format!("failed to close stdin: {}", e)))?;
        }

        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle, timeout_secs: Option<u32>) -> Result<()> {
        self.docker
            .stop_container(
                &handle.id,
                Some(StopContainerOptions {
                    t: timeout_secs.unwrap_or(10) as i64,
                }),
            )
            .await
            .map_err(|e| Error::Runtime(format!("failed to stop '{}': {}", handle.name, e)))
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .kill_container(
                &handle.id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
            .map_err(|e| Error::Runtime(format!("failed to kill '{}': {}", handle.name, e)))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::Runtime(format!("failed to remove '{}': {}", handle.name, e)))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let response = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Runtime(format!("failed to inspect '{}': {}", handle.name, e)))?;

        let state = response.state.unwrap_or_default();
        Ok(Self::map_status(
            state.status,
            state.started_at,
            state.finished_at,
            state.exit_code,
        ))
    }
}
