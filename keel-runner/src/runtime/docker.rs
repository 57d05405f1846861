//! Docker backend
//!
//! Each job gets a bridge network named after the job id. Containers join it
//! with their hostname as alias so services are reachable by name from steps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerState as DockerState, ContainerStateStatusEnum, EndpointSettings, HostConfig, Mount,
    MountTypeEnum,
};
use bollard::network::CreateNetworkOptions;
use futures::StreamExt;
use keel_core::domain::container::{ContainerId, WaitCondition};
use keel_core::domain::job::JobId;
use keel_core::domain::pipeline::ContainerSpec;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::units::ram_in_bytes;
use super::{ContainerRuntime, DispatchError, Observed, RuntimeFactory, poll_until};
use crate::output::OutputSink;

pub struct DockerRuntime {
    docker: Docker,
    work_dir: RwLock<PathBuf>,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            work_dir: RwLock::new(PathBuf::new()),
        }
    }

    /// Pulls an image to completion
    async fn pull_image(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        debug!("Pulling image {}", image);

        let (from_image, tag) = image_reference(image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("cancelled whilst pulling image {}", image)),
                item = stream.next() => match item {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("error pulling container image"),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn observe(&self, id: &ContainerId) -> Result<Observed> {
        let inspect = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .context("error inspecting container")?;

        Ok(observe_state(inspect.state.as_ref()))
    }
}

/// Splits an image reference into the repository and the tag or digest to pull
///
/// The engine pulls every tag of a repository when no tag is given, so an
/// untagged reference means `latest`.
fn image_reference(image: &str) -> (&str, &str) {
    if let Some((name, digest)) = image.split_once('@') {
        return (name, digest);
    }

    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Maps the engine's view of a container onto the wait policy input
fn observe_state(state: Option<&DockerState>) -> Observed {
    let Some(state) = state else {
        return Observed::Pending;
    };

    match state.status {
        Some(ContainerStateStatusEnum::EXITED) => Observed::Exited {
            exit_code: state.exit_code.unwrap_or_default(),
        },
        Some(ContainerStateStatusEnum::RUNNING) => Observed::Running,
        Some(ContainerStateStatusEnum::DEAD) => Observed::Failed(
            state
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "container is dead".to_string()),
        ),
        _ => Observed::Pending,
    }
}

/// Builds the engine configuration for a container of `job_id`
///
/// # Arguments
/// * `job_id` - Job owning the container, also the name of its network
/// * `work_dir` - Host directory bind mounted at the container's working dir
/// * `spec` - Container to create
pub fn container_config(
    job_id: &JobId,
    work_dir: &Path,
    spec: &ContainerSpec,
) -> Result<Config<String>> {
    let mut mounts = Vec::new();
    if !spec.working_dir.is_empty() {
        mounts.push(Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(work_dir.to_string_lossy().into_owned()),
            target: Some(spec.working_dir.clone()),
            ..Default::default()
        });
    }

    let mut aliases = Vec::new();
    if !spec.hostname.is_empty() {
        aliases.push(spec.hostname.clone());
        aliases.push(spec.hostname.to_lowercase());
    }

    let mut env: Vec<String> = spec
        .environment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    env.sort();

    let mut nano_cpus = None;
    let mut memory = None;
    if let Some(limits) = spec.resources.as_ref().and_then(|r| r.limits.as_ref()) {
        // Same meaning as docker's --cpus flag
        nano_cpus = Some((f64::from(limits.cpu) * 1e9) as i64);
        memory = ram_in_bytes(&limits.memory)?;
    }

    let entrypoint = (!spec.entrypoint.is_empty()).then(|| vec![spec.entrypoint.clone()]);

    let endpoint = EndpointSettings {
        network_id: Some(job_id.to_string()),
        aliases: (!aliases.is_empty()).then_some(aliases),
        ..Default::default()
    };

    Ok(Config {
        image: Some(spec.image.clone()),
        entrypoint,
        cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
        hostname: (!spec.hostname.is_empty()).then(|| spec.hostname.clone()),
        env: (!env.is_empty()).then_some(env),
        working_dir: (!spec.working_dir.is_empty()).then(|| spec.working_dir.clone()),
        host_config: Some(HostConfig {
            mounts: (!mounts.is_empty()).then_some(mounts),
            privileged: Some(spec.privileged),
            nano_cpus,
            memory,
            ..Default::default()
        }),
        networking_config: Some(NetworkingConfig {
            endpoints_config: HashMap::from([(job_id.to_string(), endpoint)]),
        }),
        ..Default::default()
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn initialize(&self, job_id: &JobId, work_dir: &Path) -> Result<()> {
        *self.work_dir.write().await = work_dir.to_path_buf();

        self.docker
            .create_network(CreateNetworkOptions {
                name: job_id.to_string(),
                ..Default::default()
            })
            .await
            .context("failed to initialize runner")?;

        info!("Created network {}", job_id);
        Ok(())
    }

    async fn dispatch_container(
        &self,
        job_id: &JobId,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<ContainerId, DispatchError> {
        let work_dir = self.work_dir.read().await.clone();
        let config =
            container_config(job_id, &work_dir, spec).map_err(DispatchError::before_create)?;

        self.pull_image(&spec.image, cancel)
            .await
            .map_err(DispatchError::before_create)?;

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .context("error creating container")
            .map_err(DispatchError::before_create)?;
        let id = ContainerId::new(created.id);

        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .context("error starting container")
            .map_err(|e| DispatchError::after_create(id.clone(), e))?;

        debug!("Started container {} from {}", id, spec.image);
        Ok(id)
    }

    async fn wait_for_container(
        &self,
        id: &ContainerId,
        condition: WaitCondition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        poll_until(id, condition, cancel, || self.observe(id)).await
    }

    async fn copy_logs_for_container(
        &self,
        id: &ContainerId,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = self.docker.logs(
            id.as_str(),
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("cancelled whilst copying logs")),
                item = stream.next() => item,
            };

            match item {
                None => return Ok(()),
                Some(Err(e)) => return Err(e).context("error copying logs"),
                Some(Ok(LogOutput::StdErr { message })) => stderr.write(&message).await?,
                Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                    stdout.write(&message).await?
                }
                Some(Ok(LogOutput::StdIn { .. })) => {}
            }
        }
    }

    async fn terminate_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .context("error terminating container")
    }

    async fn terminate(&self, job_id: &JobId) -> Result<()> {
        self.docker
            .remove_network(job_id.as_str())
            .await
            .context("error terminating pipeline")?;

        info!("Removed network {}", job_id);
        Ok(())
    }
}

/// Hands out runtimes sharing one engine connection
pub struct DockerRuntimeFactory {
    docker: Docker,
}

impl DockerRuntimeFactory {
    /// Connects to the local engine using the standard environment
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl RuntimeFactory for DockerRuntimeFactory {
    async fn create(&self) -> Result<Arc<dyn ContainerRuntime>> {
        Ok(Arc::new(DockerRuntime::new(self.docker.clone())))
    }
}
