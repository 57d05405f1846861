//! Runner configuration
//!
//! Decides where jobs come from (a local directory or the coordinator) and
//! which container backend runs them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use keel_core::domain::pipeline::DEFAULT_WAIT_TIMEOUT_SECS;

use crate::runtime::RuntimeKind;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Local mode: the project to build. Remote mode: parent of job directories.
    pub working_directory: PathBuf,

    /// Container backend
    pub runtime: RuntimeKind,

    /// Namespace jobs run in on Kubernetes
    pub kube_namespace: Option<String>,

    /// Persistent volume claim holding job workspaces on Kubernetes
    pub kube_volume_claim: Option<String>,

    /// Coordinator base URL, jobs are run locally when absent
    pub remote_url: Option<String>,

    /// Bearer token for the coordinator
    pub remote_token: Option<String>,

    /// Optional `.env` file consulted before the process environment
    pub env_file: Option<PathBuf>,

    /// How often to poll the coordinator for jobs and cancellations
    pub poll_interval: Duration,

    /// Default timeout for service wait clauses
    pub wait_timeout: Duration,
}

impl Config {
    /// Creates a local Docker configuration for `working_directory`
    pub fn new(working_directory: PathBuf) -> Self {
        Self {
            working_directory,
            runtime: RuntimeKind::Docker,
            kube_namespace: None,
            kube_volume_claim: None,
            remote_url: None,
            remote_token: None,
            env_file: None,
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - KEEL_WORKING_DIRECTORY (optional, default: current directory)
    /// - KEEL_RUNTIME (optional, `docker` or `kubernetes`, default: docker)
    /// - KEEL_KUBE_NAMESPACE (required for kubernetes)
    /// - KEEL_KUBE_VOLUME_CLAIM (required for kubernetes)
    /// - KEEL_REMOTE_URL (optional, enables remote mode)
    /// - KEEL_REMOTE_TOKEN (required in remote mode)
    /// - KEEL_ENV_FILE (optional)
    /// - KEEL_POLL_INTERVAL (optional, seconds, default: 1)
    /// - KEEL_WAIT_TIMEOUT (optional, seconds, default: 30)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from the variables returned by `lookup`
    ///
    /// Absent variables take their defaults. Malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let working_directory = match lookup("KEEL_WORKING_DIRECTORY") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };

        let runtime = match lookup("KEEL_RUNTIME") {
            Some(runtime) => parse_runtime(&runtime)?,
            None => RuntimeKind::Docker,
        };

        let poll_interval = match lookup("KEEL_POLL_INTERVAL") {
            Some(secs) => parse_seconds("KEEL_POLL_INTERVAL", &secs)?,
            None => Duration::from_secs(1),
        };

        let wait_timeout = match lookup("KEEL_WAIT_TIMEOUT") {
            Some(secs) => parse_seconds("KEEL_WAIT_TIMEOUT", &secs)?,
            None => Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        };

        Ok(Self {
            working_directory,
            runtime,
            kube_namespace: lookup("KEEL_KUBE_NAMESPACE"),
            kube_volume_claim: lookup("KEEL_KUBE_VOLUME_CLAIM"),
            remote_url: lookup("KEEL_REMOTE_URL"),
            remote_token: lookup("KEEL_REMOTE_TOKEN"),
            env_file: lookup("KEEL_ENV_FILE").map(PathBuf::from),
            poll_interval,
            wait_timeout,
        })
    }

    pub fn is_remote(&self) -> bool {
        self.remote_url.is_some()
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.working_directory.as_os_str().is_empty() {
            bail!("working_directory cannot be empty");
        }

        if let Some(url) = &self.remote_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("remote_url must start with http:// or https://");
            }
            if self.remote_token.as_deref().unwrap_or_default().is_empty() {
                bail!("remote_token is required when remote_url is set");
            }
        }

        if self.runtime == RuntimeKind::Kubernetes {
            if self.kube_namespace.as_deref().unwrap_or_default().is_empty() {
                bail!("kube_namespace is required for the kubernetes runtime");
            }
            if self.kube_volume_claim.as_deref().unwrap_or_default().is_empty() {
                bail!("kube_volume_claim is required for the kubernetes runtime");
            }
        }

        if self.poll_interval.as_secs() == 0 {
            bail!("poll_interval must be greater than 0");
        }

        if self.wait_timeout.as_secs() == 0 {
            bail!("wait_timeout must be greater than 0");
        }

        Ok(())
    }
}

fn parse_runtime(value: &str) -> anyhow::Result<RuntimeKind> {
    match value.to_ascii_lowercase().as_str() {
        "docker" => Ok(RuntimeKind::Docker),
        "kubernetes" | "kube" => Ok(RuntimeKind::Kubernetes),
        other => bail!("unknown runtime '{}', expected docker or kubernetes", other),
    }
}

fn parse_seconds(name: &str, value: &str) -> anyhow::Result<Duration> {
    let secs = value
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{} must be a number of seconds, got '{}'", name, value))?;
    Ok(Duration::from_secs(secs))
}

impl Default for Config {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.wait_timeout, Duration::from_secs(30));
        assert!(!config.is_remote());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_validation() {
        let mut config = Config::new(PathBuf::from("/var/lib/keel"));

        config.remote_url = Some("not-a-url".to_string());
        config.remote_token = Some("token".to_string());
        assert!(config.validate().is_err());

        config.remote_url = Some("https://ci.example.com".to_string());
        assert!(config.validate().is_ok());
        assert!(config.is_remote());

        config.remote_token = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kubernetes_validation() {
        let mut config = Config::new(PathBuf::from("/workspace"));
        config.runtime = RuntimeKind::Kubernetes;
        assert!(config.validate().is_err());

        config.kube_namespace = Some("ci".to_string());
        assert!(config.validate().is_err());

        config.kube_volume_claim = Some("workspaces".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_runtime() {
        assert_eq!(parse_runtime("docker").unwrap(), RuntimeKind::Docker);
        assert_eq!(parse_runtime("Kubernetes").unwrap(), RuntimeKind::Kubernetes);
        assert!(parse_runtime("podman").is_err());
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_remote() {
        let config = Config::from_lookup(lookup(&[
            ("KEEL_WORKING_DIRECTORY", "/var/lib/keel"),
            ("KEEL_REMOTE_URL", "https://ci.example.com"),
            ("KEEL_REMOTE_TOKEN", "t"),
            ("KEEL_RUNTIME", "kubernetes"),
            ("KEEL_KUBE_NAMESPACE", "ci"),
            ("KEEL_KUBE_VOLUME_CLAIM", "workspaces"),
            ("KEEL_WAIT_TIMEOUT", "90"),
        ]))
        .unwrap();

        assert!(config.is_remote());
        assert_eq!(config.runtime, RuntimeKind::Kubernetes);
        assert_eq!(config.wait_timeout, Duration::from_secs(90));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_rejects_unknown_runtime() {
        let err = Config::from_lookup(lookup(&[
            ("KEEL_REMOTE_URL", "https://ci.example.com"),
            ("KEEL_REMOTE_TOKEN", "t"),
            ("KEEL_RUNTIME", "kubernets"),
        ]))
        .unwrap_err();

        assert!(err.to_string().contains("unknown runtime 'kubernets'"));
    }

    #[test]
    fn test_from_lookup_rejects_malformed_durations() {
        assert!(Config::from_lookup(lookup(&[("KEEL_POLL_INTERVAL", "1s")])).is_err());
        assert!(Config::from_lookup(lookup(&[("KEEL_WAIT_TIMEOUT", "soon")])).is_err());
    }

    #[test]
    fn test_empty_working_directory() {
        let config = Config::new(PathBuf::new());
        assert!(config.validate().is_err());
    }
}
