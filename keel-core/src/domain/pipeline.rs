//! Pipeline specification types
//!
//! A `Spec` is what the pipeline parser hands to the executor. Stage names are
//! validated upstream (unique, non-empty) and assumed valid from here on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::stage::StageId;

/// Default number of seconds to wait for a service's output to match
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30;

/// A parsed pipeline definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// A runnable stage with sidecar services and steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    #[serde(rename = "name")]
    pub id: StageId,
    /// Optional gate, the stage only runs when this is absent or true
    #[serde(default)]
    pub when: Option<bool>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub services: Vec<ContainerSpec>,
    #[serde(default)]
    pub steps: Vec<ContainerSpec>,
}

impl Stage {
    pub fn should_run(&self) -> bool {
        self.when.unwrap_or(true)
    }
}

/// A container to dispatch as part of a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub resources: Option<ContainerResources>,
    #[serde(default)]
    pub wait: Option<WaitFor>,
}

/// Resource limits and requests for a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    #[serde(default)]
    pub limits: Option<ResourceUnits>,
    #[serde(default)]
    pub requests: Option<ResourceUnits>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUnits {
    /// Fractional CPU count, same meaning as docker's `--cpus`
    #[serde(default)]
    pub cpu: f32,
    /// Human memory string such as `512m` or `2g`
    #[serde(default)]
    pub memory: String,
}

/// Rule for gating progression on a service's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitFor {
    /// Regular expression matched against each log line
    pub output: String,
    /// Seconds before giving up, the runner's default when absent
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_json() {
        let spec: Spec = serde_json::from_str(
            r#"{
                "version": "1",
                "stages": [
                    {
                        "name": "test",
                        "services": [
                            {"image": "postgres:16", "hostname": "db", "wait": {"output": "ready"}}
                        ],
                        "steps": [
                            {"image": "rust:1", "workingDir": "/src", "args": ["cargo", "test"]}
                        ]
                    },
                    {"name": "deploy", "when": false}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.stages.len(), 2);
        let test = &spec.stages[0];
        assert_eq!(test.id.as_str(), "test");
        assert!(test.should_run());
        assert_eq!(test.services[0].wait.as_ref().unwrap().timeout, None);
        assert_eq!(test.steps[0].working_dir, "/src");
        assert!(!spec.stages[1].should_run());
    }
}
