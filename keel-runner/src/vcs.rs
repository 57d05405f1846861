//! Version control
//!
//! Fetches a job's repository into its working directory.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::output::OutputSink;

pub struct CloneOptions<'a> {
    pub directory: &'a Path,
    pub repository_url: &'a str,
    pub branch: &'a str,
    /// Commit to check out after cloning, the branch head when empty
    pub revision: &'a str,
    /// Receives human readable progress
    pub progress: &'a mut dyn OutputSink,
}

#[async_trait]
pub trait Vcs: Send + Sync {
    async fn clone_repository(&self, options: CloneOptions<'_>) -> Result<()>;
}

/// Uses the `git` binary found on the path
#[derive(Debug, Default, Clone)]
pub struct GitVcs;

impl GitVcs {
    /// Runs git, forwarding its output to `progress`
    async fn git(&self, args: &[&str], cwd: Option<&Path>, progress: &mut dyn OutputSink) -> Result<()> {
        debug!("Running git {}", args.join(" "));

        let mut command = Command::new("git");
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .context("Failed to execute git. Is git installed?")?;

        progress.write(&output.stdout).await?;
        progress.write(&output.stderr).await?;

        if !output.status.success() {
            anyhow::bail!(
                "git {} failed with {}:\nstdout: {}\nstderr: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn clone_repository(&self, options: CloneOptions<'_>) -> Result<()> {
        let CloneOptions {
            directory,
            repository_url,
            branch,
            revision,
            progress,
        } = options;
        let target = directory.to_string_lossy();

        progress
            .write(
                format!(
                    "cloning repository {} at branch {} to directory {}\n",
                    repository_url, branch, target
                )
                .as_bytes(),
            )
            .await?;

        let mut args = vec!["clone", "--progress"];
        if !branch.is_empty() {
            args.extend(["--branch", branch]);
        }
        args.extend([repository_url, &*target]);

        self.git(&args, None, progress).await.with_context(|| {
            format!(
                "error cloning repository {} at branch {} to directory {}",
                repository_url, branch, target
            )
        })?;

        if revision.is_empty() {
            return Ok(());
        }

        self.git(&["checkout", "--quiet", revision], Some(directory), progress)
            .await
            .with_context(|| format!("error checking out revision {}", revision))
    }
}
