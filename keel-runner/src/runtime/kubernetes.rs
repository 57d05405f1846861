//! Kubernetes backend
//!
//! A job maps to a headless service; every container is a pod whose hostname
//! and subdomain make it resolvable through that service.
//!
//! The pod log API merges stdout and stderr, so each pod also runs a `watcher`
//! container that tails the node's raw JSON log file of the workload
//! container. Reading the watcher's log gives the records back with their
//! stream attached.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector,
    PersistentVolumeClaimVolumeSource, Pod, PodDNSConfig, PodSpec, ResourceRequirements,
    SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::domain::container::{ContainerId, WaitCondition};
use keel_core::domain::job::JobId;
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::{ContainerSpec, ResourceUnits};
use kube::api::{DeleteParams, LogParams, PostParams};
use kube::{Api, Client};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::units::ram_in_bytes;
use super::{
    ContainerRuntime, DispatchError, Observed, POLL_INTERVAL, RuntimeFactory, poll_until,
};
use crate::output::OutputSink;

const SELECTOR: &str = "subdomain";
const WATCHER: &str = "watcher";
const SERVICE_PORT: i32 = 1234;

/// Kubernetes does not accept names starting with a digit
fn service_name(job_id: &JobId) -> String {
    format!("job-{}", job_id)
}

pub struct KubeRuntime {
    client: Client,
    namespace: String,
    volume_claim: String,
}

impl KubeRuntime {
    pub fn new(client: Client, namespace: impl Into<String>, volume_claim: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            volume_claim: volume_claim.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn observe(&self, id: &ContainerId) -> Result<Observed> {
        let pod = self.pods().get(id.as_str()).await.context("failed to get pod")?;
        Ok(evaluate_pod(&pod))
    }
}

// =============================================================================
// Resource builders
// =============================================================================

/// Headless service giving the job's pods a shared DNS domain
pub fn service_spec(job_id: &JobId) -> Service {
    let name = service_name(job_id);

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(BTreeMap::from([(SELECTOR.to_string(), name)])),
            ports: Some(vec![ServicePort {
                name: Some("port".to_string()),
                port: SERVICE_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resource_list(units: &ResourceUnits) -> Result<BTreeMap<String, Quantity>> {
    let mut list = BTreeMap::new();
    list.insert(
        "cpu".to_string(),
        Quantity(format!("{}n", (f64::from(units.cpu) * 1e9) as i64)),
    );
    if let Some(bytes) = ram_in_bytes(&units.memory)? {
        list.insert("memory".to_string(), Quantity(bytes.to_string()));
    }
    Ok(list)
}

/// Pod running `spec` as container `pod_name` plus its log watcher
///
/// # Arguments
/// * `job_id` - Job owning the pod
/// * `pod_name` - Name of the pod and of its workload container
/// * `namespace` - Namespace of the job service, used for DNS search
/// * `volume_claim` - Workspace claim, mounted with the job id as sub path
/// * `spec` - Container to run
pub fn pod_spec(
    job_id: &JobId,
    pod_name: &str,
    namespace: &str,
    volume_claim: &str,
    spec: &ContainerSpec,
) -> Result<Pod> {
    let service = service_name(job_id);

    let mut mounts = Vec::new();
    if !spec.working_dir.is_empty() {
        mounts.push(VolumeMount {
            name: "workspace".to_string(),
            mount_path: spec.working_dir.clone(),
            sub_path: Some(job_id.to_string()),
            ..Default::default()
        });
    }

    let mut env: Vec<EnvVar> = spec
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));

    let mut resources = ResourceRequirements::default();
    if let Some(requirements) = &spec.resources {
        if let Some(limits) = &requirements.limits {
            resources.limits = Some(resource_list(limits)?);
        }
        if let Some(requests) = &requirements.requests {
            resources.requests = Some(resource_list(requests)?);
        }
    }

    let workload = Container {
        name: pod_name.to_string(),
        image: Some(spec.image.clone()),
        command: (!spec.entrypoint.is_empty()).then(|| vec![spec.entrypoint.clone()]),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!env.is_empty()).then_some(env),
        working_dir: (!spec.working_dir.is_empty()).then(|| spec.working_dir.clone()),
        stdin: Some(true),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        security_context: Some(SecurityContext {
            privileged: Some(spec.privileged),
            ..Default::default()
        }),
        resources: Some(resources),
        ..Default::default()
    };

    let watcher = Container {
        name: WATCHER.to_string(),
        image: Some("busybox".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), "--".to_string()]),
        args: Some(vec![format!(
            "tail -F -q -n +1 /var/log/pods/*$POD_ID/*{}/0.log",
            pod_name
        )]),
        env: Some(vec![EnvVar {
            name: "POD_ID".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.uid".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "pod-logs".to_string(),
                mount_path: "/var/log/pods".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "container-logs".to_string(),
                mount_path: "/var/lib/docker/containers".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let host_path = |name: &str, path: &str| Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            labels: Some(BTreeMap::from([(SELECTOR.to_string(), service.clone())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![workload, watcher],
            hostname: (!spec.hostname.is_empty()).then(|| spec.hostname.clone()),
            subdomain: Some(service.clone()),
            dns_config: Some(PodDNSConfig {
                searches: Some(vec![format!("{}.{}.svc.cluster.local", service, namespace)]),
                ..Default::default()
            }),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            volumes: Some(vec![
                Volume {
                    name: "workspace".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: volume_claim.to_string(),
                        read_only: Some(false),
                    }),
                    ..Default::default()
                },
                host_path("pod-logs", "/var/log/pods"),
                host_path("container-logs", "/var/lib/docker/containers"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// =============================================================================
// Pod state and logs
// =============================================================================

/// Maps a pod onto the wait policy input, ignoring the watcher container
pub fn evaluate_pod(pod: &Pod) -> Observed {
    let Some(status) = &pod.status else {
        return Observed::Pending;
    };

    if let Some(phase) = status.phase.as_deref() {
        if phase == "Failed" || phase == "CrashLoopBackOff" {
            return Observed::Failed(format!("pod could not be scheduled: {}", phase));
        }
    }

    let statuses = status.container_statuses.as_deref().unwrap_or_default();

    for container in statuses.iter().filter(|c| c.name != WATCHER) {
        let Some(state) = &container.state else {
            continue;
        };
        if let Some(terminated) = &state.terminated {
            return Observed::Exited {
                exit_code: i64::from(terminated.exit_code),
            };
        }
        if state.running.is_some() {
            return Observed::Running;
        }
    }

    for container in statuses {
        let message = container
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.message.as_deref())
            .unwrap_or_default();
        if !message.is_empty() {
            return Observed::Failed(format!("failure waiting for pod: {}", message));
        }
    }

    Observed::Pending
}

fn workload_terminated(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|c| {
                c.name != WATCHER && c.state.as_ref().is_some_and(|s| s.terminated.is_some())
            })
        })
}

/// One record of the container runtime's JSON log file
#[derive(Debug, Deserialize)]
struct RawLogRecord {
    log: String,
    stream: String,
    time: DateTime<Utc>,
}

/// A decoded log record newer than the high-water mark
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub stream: LogStream,
    pub log: String,
}

/// Decodes the watcher's output
///
/// Records at or before `since` are skipped, the API's `sinceTime` is not
/// precise enough to rely on. Returns the new records and the new
/// high-water mark.
pub fn decode_log_records(
    text: &str,
    since: Option<DateTime<Utc>>,
) -> Result<(Vec<LogRecord>, Option<DateTime<Utc>>)> {
    let mut records = Vec::new();
    let mut high_water = since;

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let raw: RawLogRecord = serde_json::from_str(line).context("error decoding log")?;

        if since.is_some_and(|since| raw.time <= since) {
            continue;
        }
        high_water = Some(raw.time);

        let stream = match raw.stream.as_str() {
            "stdout" => LogStream::Stdout,
            "stderr" => LogStream::Stderr,
            _ => continue,
        };
        records.push(LogRecord {
            stream,
            log: raw.log,
        });
    }

    Ok((records, high_water))
}

/// Result of one poll of the watcher's log
#[derive(Debug)]
pub struct LogPoll {
    pub records: Vec<LogRecord>,
    /// High-water mark for the next poll
    pub since: Option<DateTime<Utc>>,
    /// No more output will arrive
    pub done: bool,
}

/// Decodes one poll of the watcher's log
///
/// `terminated` must be observed before the log is read. Copying is done only
/// once the workload had terminated and a whole poll brought nothing new,
/// which is what keeps the lines written just before exit.
pub fn poll_logs(text: &str, since: Option<DateTime<Utc>>, terminated: bool) -> Result<LogPoll> {
    let (records, since) = decode_log_records(text, since)?;
    let done = terminated && records.is_empty();
    Ok(LogPoll {
        records,
        since,
        done,
    })
}

/// Maps a failed pod create onto what dispatch leaves behind
///
/// A 4xx means the API server refused the pod. Any other failure may have
/// happened after the pod was accepted, so the name is kept for cleanup.
fn create_failure(pod_name: &str, error: kube::Error) -> DispatchError {
    let rejected = matches!(&error, kube::Error::Api(response) if (400..500).contains(&response.code));
    let error = anyhow::Error::new(error).context("error creating pod");

    if rejected {
        DispatchError::before_create(error)
    } else {
        DispatchError::after_create(ContainerId::new(pod_name), error)
    }
}

#[async_trait]
impl ContainerRuntime for KubeRuntime {
    async fn initialize(&self, job_id: &JobId, _work_dir: &std::path::Path) -> Result<()> {
        self.services()
            .create(&PostParams::default(), &service_spec(job_id))
            .await
            .context("error initializing runner")?;

        info!("Created service {} in {}", service_name(job_id), self.namespace);
        Ok(())
    }

    async fn dispatch_container(
        &self,
        job_id: &JobId,
        spec: &ContainerSpec,
        _cancel: &CancellationToken,
    ) -> Result<ContainerId, DispatchError> {
        self.services()
            .get(&service_name(job_id))
            .await
            .context("error getting service, may not exist")
            .map_err(DispatchError::before_create)?;

        let pod_name = format!("keel-container-{}", Uuid::new_v4().simple());
        let pod = pod_spec(job_id, &pod_name, &self.namespace, &self.volume_claim, spec)
            .map_err(DispatchError::before_create)?;

        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| create_failure(&pod_name, e))?;

        debug!("Created pod {} from {}", pod_name, spec.image);
        Ok(ContainerId::new(pod_name))
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
        let pods = self.pods();
        let mut since: Option<DateTime<Utc>> = None;

        loop {
            if cancel.is_cancelled() {
                bail!("cancelled whilst copying logs");
            }

            let pod = pods
                .get(id.as_str())
                .await
                .context("error getting pod for logs")?;

            let params = LogParams {
                container: Some(WATCHER.to_string()),
                since_time: since,
                ..Default::default()
            };
            let text = pods
                .logs(id.as_str(), &params)
                .await
                .context("error getting logs")?;

            let poll = poll_logs(&text, since, workload_terminated(&pod))?;
            for record in &poll.records {
                match record.stream {
                    LogStream::Stdout => stdout.write(record.log.as_bytes()).await?,
                    LogStream::Stderr => stderr.write(record.log.as_bytes()).await?,
                }
            }
            since = poll.since;

            if poll.done {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled whilst copying logs"),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn terminate_container(&self, id: &ContainerId) -> Result<()> {
        self.pods()
            .delete(id.as_str(), &DeleteParams::default())
            .await
            .context("error terminating container")?;
        Ok(())
    }

    async fn terminate(&self, job_id: &JobId) -> Result<()> {
        self.services()
            .delete(&service_name(job_id), &DeleteParams::default())
            .await
            .context("failed to remove kubernetes service")?;

        info!("Removed service {}", service_name(job_id));
        Ok(())
    }
}

pub struct KubeRuntimeFactory {
    client: Client,
    namespace: String,
    volume_claim: String,
}

impl KubeRuntimeFactory {
    /// Connects using the in-cluster configuration or the local kubeconfig
    pub async fn connect(namespace: impl Into<String>, volume_claim: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        Ok(Self {
            client,
            namespace: namespace.into(),
            volume_claim: volume_claim.into(),
        })
    }
}

#[async_trait]
impl RuntimeFactory for KubeRuntimeFactory {
    async fn create(&self) -> Result<Arc<dyn ContainerRuntime>> {
        Ok(Arc::new(KubeRuntime::new(
            self.client.clone(),
            self.namespace.clone(),
            self.volume_claim.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodStatus,
    };
    use keel_core::domain::pipeline::ContainerResources;

    fn status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    fn pod_with(phase: &str, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_spec() {
        let service = service_spec(&JobId::new("42"));
        assert_eq!(service.metadata.name.as_deref(), Some("job-42"));

        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.selector.unwrap().get("subdomain").unwrap(), "job-42");
        assert_eq!(spec.ports.unwrap()[0].port, 1234);
    }

    #[test]
    fn test_pod_spec_privileged_and_working_dir() {
        let container = ContainerSpec {
            image: "alpine:3".to_string(),
            hostname: "db".to_string(),
            working_dir: "/workspace".to_string(),
            privileged: true,
            resources: Some(ContainerResources {
                limits: Some(ResourceUnits {
                    cpu: 0.25,
                    memory: "1k".to_string(),
                }),
                requests: None,
            }),
            ..Default::default()
        };

        let pod = pod_spec(&JobId::new("42"), "keel-container-x", "ci", "workspace-claim", &container)
            .unwrap();
        let spec = pod.spec.unwrap();

        assert_eq!(spec.containers.len(), 2);
        let workload = &spec.containers[0];
        assert_eq!(workload.name, "keel-container-x");
        assert_eq!(workload.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(
            workload.security_context.as_ref().unwrap().privileged,
            Some(true)
        );

        let mount = &workload.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/workspace");
        assert_eq!(mount.sub_path.as_deref(), Some("42"));

        let limits = workload.resources.as_ref().unwrap().limits.clone().unwrap();
        assert_eq!(limits.get("cpu").unwrap().0, "250000000n");
        assert_eq!(limits.get("memory").unwrap().0, "1024");

        let watcher = &spec.containers[1];
        assert_eq!(watcher.name, "watcher");
        assert!(watcher.args.as_ref().unwrap()[0].ends_with("*keel-container-x/0.log"));

        assert_eq!(spec.subdomain.as_deref(), Some("job-42"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.termination_grace_period_seconds, Some(0));
        assert_eq!(
            spec.dns_config.unwrap().searches.unwrap(),
            vec!["job-42.ci.svc.cluster.local".to_string()]
        );
    }

    #[test]
    fn test_evaluate_pod() {
        let running = ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        };
        let exited = ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        let pulling = ContainerState {
            waiting: Some(ContainerStateWaiting {
                message: Some("Back-off pulling image".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(evaluate_pod(&Pod::default()), Observed::Pending);
        assert!(matches!(
            evaluate_pod(&pod_with("Failed", vec![])),
            Observed::Failed(_)
        ));
        assert_eq!(
            evaluate_pod(&pod_with(
                "Running",
                vec![status("watcher", running.clone()), status("app", running.clone())]
            )),
            Observed::Running
        );
        assert_eq!(
            evaluate_pod(&pod_with("Running", vec![status("app", exited)])),
            Observed::Exited { exit_code: 1 }
        );
        // The watcher running alone does not count
        assert!(matches!(
            evaluate_pod(&pod_with(
                "Pending",
                vec![status("watcher", running), status("app", pulling)]
            )),
            Observed::Failed(_)
        ));
    }

    #[test]
    fn test_decode_log_records() {
        let text = concat!(
            r#"{"log":"hello\n","stream":"stdout","time":"2024-01-01T00:00:01Z"}"#,
            "\n",
            r#"{"log":"oops\n","stream":"stderr","time":"2024-01-01T00:00:02Z"}"#,
            "\n",
        );

        let (records, since) = decode_log_records(text, None).unwrap();
        assert_eq!(
            records,
            vec![
                LogRecord {
                    stream: LogStream::Stdout,
                    log: "hello\n".to_string()
                },
                LogRecord {
                    stream: LogStream::Stderr,
                    log: "oops\n".to_string()
                },
            ]
        );

        // Nothing new past the high-water mark
        let (records, again) = decode_log_records(text, since).unwrap();
        assert!(records.is_empty());
        assert_eq!(again, since);

        assert!(decode_log_records("not json", None).is_err());
    }

    const LAST_LINE: &str = r#"{"log":"done\n","stream":"stdout","time":"2024-01-01T00:00:05Z"}"#;

    #[test]
    fn test_terminated_with_new_lines_keeps_copying() {
        let poll = poll_logs(LAST_LINE, None, true).unwrap();
        assert!(!poll.done);
        assert_eq!(poll.records.len(), 1);
        assert_eq!(poll.since, Some("2024-01-01T00:00:05Z".parse().unwrap()));
    }

    #[test]
    fn test_terminated_with_nothing_new_is_done() {
        let since = Some("2024-01-01T00:00:05Z".parse().unwrap());
        let poll = poll_logs(LAST_LINE, since, true).unwrap();
        assert!(poll.done);
        assert!(poll.records.is_empty());
        assert_eq!(poll.since, since);

        assert!(poll_logs("", None, true).unwrap().done);
    }

    #[test]
    fn test_running_with_nothing_new_keeps_copying() {
        let since = Some("2024-01-01T00:00:05Z".parse().unwrap());
        let poll = poll_logs(LAST_LINE, since, false).unwrap();
        assert!(!poll.done);
        assert!(poll.records.is_empty());
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code,
        })
    }

    #[test]
    fn test_rejected_pod_create_leaves_nothing() {
        let failure = create_failure("keel-container-abc", api_error(403));
        assert!(failure.container_id.is_empty());
        assert!(format!("{:#}", failure.source).contains("error creating pod"));
    }

    #[test]
    fn test_failed_pod_create_keeps_name_for_cleanup() {
        let failure = create_failure("keel-container-abc", api_error(504));
        assert_eq!(failure.container_id, ContainerId::new("keel-container-abc"));
    }
}
