//! Keel Runner
//!
//! Executes CI/CD jobs as sequences of containers.
//!
//! Architecture:
//! - Trigger: where jobs come from (one local build, or coordinator polling)
//! - Pipeline: workspace preparation and stage execution for a single job
//! - Runtime: container backends (Docker, Kubernetes)
//! - Recorder: progress reporting (tracing output, or the coordinator)
//!
//! Jobs are processed one at a time. The final state of every job is reported
//! back to its trigger, which is what lets it hand out the next one.

mod config;
mod environment;
mod errors;
mod output;
mod parser;
mod pipeline;
mod recorder;
mod remote;
mod runtime;
#[cfg(test)]
mod testing;
mod trigger;
mod vcs;

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_client::CoordinatorClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::environment::{EnvironmentFactory, LocalEnvironmentFactory, RemoteEnvironmentFactory};
use crate::pipeline::{JobHandler, LocalWorkspace};
use crate::recorder::{LocalRecorder, Recorder, RemoteRecorder};
use crate::remote::Remote;
use crate::runtime::{DockerRuntimeFactory, KubeRuntimeFactory, RuntimeFactory, RuntimeKind};
use crate::trigger::{LocalTrigger, RemoteTrigger, Trigger};
use crate::vcs::GitVcs;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Runner");

    let config = load_config()?;
    info!(
        "Loaded configuration: runtime={:?}, remote={}, working_directory={}",
        config.runtime,
        config.is_remote(),
        config.working_directory.display()
    );

    let runtime_factory = create_runtime_factory(&config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling running job");
                shutdown.cancel();
            }
        }
    });

    let (trigger, recorder, environment) = create_job_source(&config);
    let workspace = Arc::new(LocalWorkspace::new(
        Arc::new(GitVcs),
        environment,
        recorder.clone(),
    ));
    let handler =
        JobHandler::new(runtime_factory, recorder, workspace).with_wait_timeout(config.wait_timeout);

    info!("Runner initialized successfully, waiting for jobs");

    let mut events = trigger.await_jobs(shutdown.clone());
    while let Some(event) = events.recv().await {
        handler.handle(event).await;
    }

    info!("No more jobs, shutting down");
    Ok(())
}

/// Loads and validates configuration from environment variables
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Failed to load config from environment")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn create_runtime_factory(config: &Config) -> Result<Arc<dyn RuntimeFactory>> {
    Ok(match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntimeFactory::connect()?),
        RuntimeKind::Kubernetes => Arc::new(
            KubeRuntimeFactory::connect(
                config.kube_namespace.clone().unwrap_or_default(),
                config.kube_volume_claim.clone().unwrap_or_default(),
            )
            .await
            .context("Failed to initialize kubernetes runtime")?,
        ),
    })
}

/// Wires the trigger and its collaborators for local or remote mode
fn create_job_source(
    config: &Config,
) -> (
    Box<dyn Trigger>,
    Arc<dyn Recorder>,
    Arc<dyn EnvironmentFactory>,
) {
    match &config.remote_url {
        Some(url) => {
            let client = CoordinatorClient::new(url.as_str())
                .with_token(config.remote_token.clone().unwrap_or_default());
            let remote: Arc<dyn Remote> = Arc::new(client);
            info!("Polling coordinator at {}", url);

            (
                Box::new(RemoteTrigger::new(
                    remote.clone(),
                    config.working_directory.clone(),
                    config.poll_interval,
                )),
                Arc::new(RemoteRecorder::new(remote.clone())),
                Arc::new(RemoteEnvironmentFactory::new(remote)),
            )
        }
        None => (
            Box::new(LocalTrigger::new(config.working_directory.clone())),
            Arc::new(LocalRecorder::new()),
            Arc::new(LocalEnvironmentFactory::new(config.env_file.clone())),
        ),
    }
}
