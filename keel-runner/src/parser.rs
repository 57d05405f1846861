//! Pipeline file parsing
//!
//! Pipelines are JSON documents. String values may reference environment
//! values and secrets with `${{ env.NAME }}` and `${{ secret.NAME }}`, which
//! are resolved before the document is deserialized.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use keel_core::domain::pipeline::Spec;
use regex::{Captures, Regex};
use thiserror::Error;

use crate::environment::EnvironmentProvider;

/// Name of the pipeline file at the root of a repository
pub const PIPELINE_FILE: &str = ".keel.json";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*(env|secret)\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .expect("static regex is valid")
});

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request path {path} is outside of working directory {working_directory}")]
    OutsideWorkingDirectory {
        path: PathBuf,
        working_directory: PathBuf,
    },

    #[error("error reading file '{file}': {source}")]
    Read {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error resolving {kind} '{name}': {message}")]
    Lookup {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("error parsing json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stage names should not be empty")]
    EmptyStageName,

    #[error("stage names should be unique, '{0}' is used more than once")]
    DuplicateStage(String),
}

#[async_trait]
pub trait Parser: Send + Sync {
    /// Parses `file_name`, relative to the parser's working directory
    async fn parse(&self, file_name: &str) -> Result<Spec, ParseError>;
}

pub struct JsonParser {
    working_directory: PathBuf,
    environment: Arc<dyn EnvironmentProvider>,
}

impl JsonParser {
    pub fn new(working_directory: impl Into<PathBuf>, environment: Arc<dyn EnvironmentProvider>) -> Self {
        Self {
            working_directory: working_directory.into(),
            environment,
        }
    }

    /// Replaces every placeholder in `text` with its resolved value
    async fn interpolate(&self, text: &str) -> Result<String, ParseError> {
        let mut wanted = HashSet::new();
        for captures in PLACEHOLDER.captures_iter(text) {
            wanted.insert((captures[1].to_string(), captures[2].to_string()));
        }

        let mut resolved = HashMap::new();
        for (kind, name) in wanted {
            let value = if kind == "secret" {
                self.environment.get_secret(&name).await
            } else {
                self.environment.get_value(&name).await
            };
            let value = value.map_err(|e| ParseError::Lookup {
                kind: if kind == "secret" { "secret" } else { "value" },
                name: name.clone(),
                message: format!("{:#}", e),
            })?;
            resolved.insert((kind, name), escape_json(&value));
        }

        Ok(PLACEHOLDER
            .replace_all(text, |captures: &Captures| {
                resolved
                    .get(&(captures[1].to_string(), captures[2].to_string()))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned())
    }
}

/// Escapes a value for use inside a JSON string literal
fn escape_json(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Resolves `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Drops gated stages and checks stage names
fn finalize(mut spec: Spec) -> Result<Spec, ParseError> {
    spec.stages.retain(|stage| stage.should_run());

    let mut seen = HashSet::new();
    for stage in &spec.stages {
        let name = stage.id.as_str().trim();
        if name.is_empty() {
            return Err(ParseError::EmptyStageName);
        }
        if !seen.insert(name.to_string()) {
            return Err(ParseError::DuplicateStage(name.to_string()));
        }
    }

    Ok(spec)
}

#[async_trait]
impl Parser for JsonParser {
    async fn parse(&self, file_name: &str) -> Result<Spec, ParseError> {
        let root = normalize(&self.working_directory);
        let path = normalize(&root.join(file_name));
        if !path.starts_with(&root) {
            return Err(ParseError::OutsideWorkingDirectory {
                path,
                working_directory: self.working_directory.clone(),
            });
        }

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ParseError::Read {
                file: path.clone(),
                source,
            })?;

        let text = self.interpolate(&text).await?;
        finalize(serde_json::from_str(&text)?)
    }
}
