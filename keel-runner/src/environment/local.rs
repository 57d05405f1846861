use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;

use super::{EnvironmentFactory, EnvironmentProvider};

static ENV_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^=]+)=(.+)$").expect("static regex is valid"));

/// Looks names up in an optional `.env` file first, then the process environment
///
/// Values and secrets are not distinguished locally.
#[derive(Debug, Clone, Default)]
pub struct LocalEnvironmentFactory {
    dot_env: Option<PathBuf>,
}

impl LocalEnvironmentFactory {
    pub fn new(dot_env: Option<PathBuf>) -> Self {
        Self { dot_env }
    }
}

impl EnvironmentFactory for LocalEnvironmentFactory {
    fn create(&self, _search_path: Vec<String>) -> Arc<dyn EnvironmentProvider> {
        Arc::new(LocalEnvironment {
            dot_env: self.dot_env.clone(),
        })
    }
}

struct LocalEnvironment {
    dot_env: Option<PathBuf>,
}

impl LocalEnvironment {
    async fn resolve(&self, name: &str) -> Result<String> {
        if let Some(path) = &self.dot_env {
            let contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("error opening .env file {}", path.display()))?;

            for line in contents.lines() {
                let Some(captures) = ENV_LINE.captures(line) else {
                    bail!("error parsing .env file, invalid format: '{}'", line);
                };
                if &captures[1] == name {
                    return Ok(captures[2].to_string());
                }
            }
        }

        std::env::var(name).map_err(|_| anyhow!("error getting environment variable {}", name))
    }
}

#[async_trait]
impl EnvironmentProvider for LocalEnvironment {
    async fn get_value(&self, name: &str) -> Result<String> {
        self.resolve(name).await
    }

    async fn get_secret(&self, name: &str) -> Result<String> {
        self.resolve(name).await
    }
}
