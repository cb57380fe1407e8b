//! Cluster access used by the engine
//!
//! [`ClusterClient`] is the only way engine code talks to Kubernetes, so
//! parameter resolution, condition waits and pod runs can all be exercised
//! against mocks. [`KubeClusterClient`] is the production implementation.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_common::crd::{ObjectReference, Profile};
use bulwark_common::kube_utils::api_resource_for_ref;
use futures::io::AsyncBufRead;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Status};
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use kube::Client;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::{Error, Result};

/// Streaming pod log reader
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Workload kinds the engine can resolve and scale
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 Deployment
    Deployment,
}

impl WorkloadKind {
    /// Parse a kind name case-insensitively
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_lowercase().as_str() {
            "statefulset" => Some(Self::StatefulSet),
            "deployment" => Some(Self::Deployment),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StatefulSet => write!(f, "statefulset"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// Replica state of a workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Workload {
    /// Name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Desired replicas
    pub replicas: i32,
    /// Replicas reporting ready
    pub ready_replicas: i32,
    /// Label selector for the workload's pods, in `k=v,k2=v2` form
    pub selector: String,
}

/// Result of running a command in a container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Process exit code; 0 on success
    pub exit_code: i32,
}

/// Operations the engine needs from the cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch any object by group/version/resource/namespace/name as JSON
    async fn get_object(&self, obj: &ObjectReference) -> Result<Value>;

    /// Fetch a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Fetch a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Fetch a Profile
    async fn get_profile(&self, namespace: &str, name: &str) -> Result<Profile>;

    /// Fetch a PersistentVolumeClaim
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    /// Fetch the replica state of a workload
    async fn get_workload(&self, kind: WorkloadKind, namespace: &str, name: &str)
        -> Result<Workload>;

    /// Set a workload's desired replica count
    async fn scale_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Create a pod, returning the created object with its generated name
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Fetch a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Delete a pod; deleting a pod that is already gone succeeds
    async fn delete_pod(&self, namespace: &str, name: &str, grace: Option<Duration>)
        -> Result<()>;

    /// Follow a container's logs until the container exits
    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        container: Option<String>,
    ) -> Result<LogStream>;

    /// Run a command in a container and capture its output
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<String>,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// [`ClusterClient`] over a `kube::Client`
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_object(&self, obj: &ObjectReference) -> Result<Value> {
        let ar = api_resource_for_ref(obj)?;
        let api: Api<DynamicObject> = if obj.namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), &obj.namespace, &ar)
        };
        let object = api.get(&obj.name).await?;
        Ok(serde_json::to_value(object)?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_profile(&self, namespace: &str, name: &str) -> Result<Profile> {
        let api: Api<Profile> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        match kind {
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let ss = api.get(name).await?;
                let spec = ss.spec.unwrap_or_default();
                let status = ss.status.unwrap_or_default();
                Ok(Workload {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    replicas: spec.replicas.unwrap_or(1),
                    ready_replicas: status.ready_replicas.unwrap_or(0),
                    selector: selector_string(&spec.selector)?,
                })
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let deploy = api.get(name).await?;
                let spec = deploy.spec.unwrap_or_default();
                let status = deploy.status.unwrap_or_default();
                Ok(Workload {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    replicas: spec.replicas.unwrap_or(1),
                    ready_replicas: status.ready_replicas.unwrap_or(0),
                    selector: selector_string(&spec.selector)?,
                })
            }
        }
    }

    async fn scale_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        let patch = json!({"spec": {"replicas": replicas}});
        let params = PatchParams::default();
        match kind {
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &params, &Patch::Merge(&patch)).await?;
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self
            .pods(namespace)
            .create(&PostParams::default(), pod)
            .await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace: Option<Duration>,
    ) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: grace.map(|g| g.as_secs() as u32),
            ..DeleteParams::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, pod = name, "pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        container: Option<String>,
    ) -> Result<LogStream> {
        let params = LogParams {
            container,
            follow: true,
            ..LogParams::default()
        };
        let stream = self.pods(namespace).log_stream(name, &params).await?;
        Ok(Box::pin(stream))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<String>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let params = AttachParams {
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            container,
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        };
        let mut attached = self.pods(namespace).exec(pod, command, &params).await?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout_reader), read_stream(stderr_reader));
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| {
                Error::execution(format!("exec in pod {namespace}/{pod}"), e.to_string())
            })?;

        Ok(ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
            exit_code: exit_code(status.as_ref()),
        })
    }
}

async fn read_stream(reader: Option<impl AsyncRead + Unpin>) -> Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::execution("read exec stream", e.to_string()))?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Exit code from an exec Status; a missing status means success
fn exit_code(status: Option<&Status>) -> i32 {
    let Some(status) = status else { return 0 };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse().ok())
        })
        .unwrap_or(1)
}

/// Render a label selector in list-parameter form
///
/// `matchLabels` become `k=v` and `matchExpressions` become `k in (a,b)`,
/// `k notin (a,b)`, `k` or `!k`, all joined with commas.
pub fn selector_string(selector: &LabelSelector) -> Result<String> {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    for expr in selector.match_expressions.iter().flatten() {
        let values = || expr.values.clone().unwrap_or_default().join(",");
        let term = match expr.operator.as_str() {
            "In" => format!("{} in ({})", expr.key, values()),
            "NotIn" => format!("{} notin ({})", expr.key, values()),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(Error::execution(
                    "render label selector",
                    format!("unsupported operator {other:?} for key {:?}", expr.key),
                ))
            }
        };
        terms.push(term);
    }
    Ok(terms.join(","))
}
