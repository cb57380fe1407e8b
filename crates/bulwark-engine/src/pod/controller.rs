//! Lifecycle control of a single engine-created pod

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::options::{PodOptions, DEFAULT_CONTAINER_NAME};
use crate::cluster::{ClusterClient, LogStream};
use crate::context::EngineConfig;
use crate::poll::{poll_until, Backoff, Poll};
use crate::{Error, Result};

// Waiting reasons that will not resolve by themselves
const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// The operations a pod run depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodController: Send + Sync {
    /// Namespace of the pod
    fn namespace(&self) -> String;

    /// Name of the pod once started
    fn pod_name(&self) -> Option<String>;

    /// Create the pod, returning its name
    async fn start_pod(&self) -> Result<String>;

    /// Wait until the pod has left Pending
    async fn wait_for_pod_ready(&self, cancel: &CancellationToken) -> Result<()>;

    /// Wait until the pod has run to successful completion
    async fn wait_for_pod_completion(&self, cancel: &CancellationToken) -> Result<()>;

    /// Follow the work container's logs
    async fn stream_pod_logs(&self) -> Result<LogStream>;

    /// Delete the pod
    async fn stop_pod(&self, grace: Option<Duration>) -> Result<()>;
}

/// Creates a controller per pod run
#[cfg_attr(test, mockall::automock)]
pub trait PodControllerFactory: Send + Sync {
    /// Controller for a pod built from `options`
    fn controller(&self, options: PodOptions) -> Arc<dyn PodController>;
}

/// [`PodControllerFactory`] producing [`KubePodController`]s
pub struct KubePodControllerFactory {
    cluster: Arc<dyn ClusterClient>,
    backoff: Backoff,
    ready_timeout: Duration,
    completion_timeout: Duration,
}

impl KubePodControllerFactory {
    /// Factory using the poll settings in `config`
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &EngineConfig) -> Self {
        Self {
            cluster,
            backoff: config.poll_backoff,
            ready_timeout: config.pod_ready_timeout,
            completion_timeout: config.pod_completion_timeout,
        }
    }
}

impl PodControllerFactory for KubePodControllerFactory {
    fn controller(&self, options: PodOptions) -> Arc<dyn PodController> {
        Arc::new(KubePodController {
            cluster: self.cluster.clone(),
            options,
            backoff: self.backoff,
            ready_timeout: self.ready_timeout,
            completion_timeout: self.completion_timeout,
            name: Mutex::new(None),
        })
    }
}

/// [`PodController`] over a [`ClusterClient`]
pub struct KubePodController {
    cluster: Arc<dyn ClusterClient>,
    options: PodOptions,
    backoff: Backoff,
    ready_timeout: Duration,
    completion_timeout: Duration,
    name: Mutex<Option<String>>,
}

impl KubePodController {
    fn started_name(&self) -> Result<String> {
        self.name
            .lock()
            .clone()
            .ok_or_else(|| Error::execution("pod controller", "pod has not been started"))
    }
}

#[async_trait]
impl PodController for KubePodController {
    fn namespace(&self) -> String {
        self.options.namespace.clone()
    }

    fn pod_name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    async fn start_pod(&self) -> Result<String> {
        if let Some(name) = self.pod_name() {
            return Err(Error::execution(
                format!("start pod {}/{}", self.options.namespace, name),
                "pod already started",
            ));
        }
        let pod = self.options.build_pod()?;
        let created = self.cluster.create_pod(&self.options.namespace, &pod).await?;
        let name = created.metadata.name.unwrap_or_default();
        if name.is_empty() {
            return Err(Error::execution("create pod", "API server returned a pod with no name"));
        }
        info!(
            namespace = %self.options.namespace,
            pod = %name,
            image = %self.options.image,
            "pod created"
        );
        *self.name.lock() = Some(name.clone());
        Ok(name)
    }

    async fn wait_for_pod_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.started_name()?;
        let namespace = self.options.namespace.as_str();
        let what = format!("pod {namespace}/{name} to be ready");
        let (cluster, pod_name) = (&self.cluster, name.as_str());
        let waited = poll_until(cancel, self.ready_timeout, self.backoff, &what, || async move {
            let pod = cluster.get_pod(namespace, pod_name).await?;
            ready_state(namespace, pod_name, &pod)
        })
        .await;
        match waited {
            Ok(()) => {
                debug!(namespace, pod = %name, "pod ready");
                Ok(())
            }
            Err(Error::Timeout { last_error, .. }) => Err(Error::pod_not_ready(
                namespace,
                &name,
                last_error.unwrap_or_else(|| "timed out".to_string()),
            )),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_pod_completion(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.started_name()?;
        let namespace = self.options.namespace.as_str();
        let what = format!("pod {namespace}/{name} to complete");
        let (cluster, pod_name) = (&self.cluster, name.as_str());
        poll_until(cancel, self.completion_timeout, self.backoff, &what, || async move {
            let pod = cluster.get_pod(namespace, pod_name).await?;
            completion_state(namespace, pod_name, &pod)
        })
        .await
    }

    async fn stream_pod_logs(&self) -> Result<LogStream> {
        let name = self.started_name()?;
        self.cluster
            .pod_logs(
                &self.options.namespace,
                &name,
                Some(DEFAULT_CONTAINER_NAME.to_string()),
            )
            .await
    }

    async fn stop_pod(&self, grace: Option<Duration>) -> Result<()> {
        let name = self.started_name()?;
        self.cluster
            .delete_pod(&self.options.namespace, &name, grace)
            .await?;
        info!(namespace = %self.options.namespace, pod = %name, "pod deleted");
        Ok(())
    }
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

/// Ready once the pod has left Pending; unrecoverable waits fail at once
fn ready_state(namespace: &str, name: &str, pod: &Pod) -> Result<Poll<()>> {
    match phase(pod) {
        "" => Ok(Poll::Pending(Some("pod has no phase yet".to_string()))),
        "Pending" => {
            if let Some((container, reason, message)) = fatal_waiting(pod.status.as_ref()) {
                return Err(Error::pod_not_ready(
                    namespace,
                    name,
                    format!("container {container} is waiting: {reason}: {message}"),
                ));
            }
            Ok(Poll::Pending(Some("pod is Pending".to_string())))
        }
        _ => Ok(Poll::Ready(())),
    }
}

fn fatal_waiting(status: Option<&PodStatus>) -> Option<(String, String, String)> {
    status?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|cs| {
            let waiting = cs.state.as_ref()?.waiting.as_ref()?;
            let reason = waiting.reason.as_deref()?;
            FATAL_WAITING_REASONS.contains(&reason).then(|| {
                (
                    cs.name.clone(),
                    reason.to_string(),
                    waiting.message.clone().unwrap_or_default(),
                )
            })
        })
}

/// Done on Succeeded; Failed or a non-zero container exit is an error
fn completion_state(namespace: &str, name: &str, pod: &Pod) -> Result<Poll<()>> {
    let context = format!("pod {namespace}/{name}");
    match phase(pod) {
        "Succeeded" => Ok(Poll::Ready(())),
        "Failed" => {
            let status = pod.status.as_ref();
            let reason = status.and_then(|s| s.reason.clone()).unwrap_or_default();
            let message = status.and_then(|s| s.message.clone()).unwrap_or_default();
            let detail = terminated_failure(status)
                .unwrap_or_else(|| format!("pod failed: {reason} {message}").trim().to_string());
            Err(Error::execution(context, detail))
        }
        "Running" => match terminated_failure(pod.status.as_ref()) {
            Some(detail) => Err(Error::execution(context, detail)),
            None => Ok(Poll::Pending(None)),
        },
        other => Ok(Poll::Pending(Some(format!("pod is {other}")))),
    }
}

fn terminated_failure(status: Option<&PodStatus>) -> Option<String> {
    status?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|cs| {
            let terminated = cs.state.as_ref()?.terminated.as_ref()?;
            (terminated.exit_code != 0).then(|| {
                format!(
                    "container {} terminated with exit code {}: {}",
                    cs.name,
                    terminated.exit_code,
                    terminated.reason.clone().unwrap_or_default()
                )
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
    };
    use kube::api::ObjectMeta;

    fn pod_in(phase: &str, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("bulwark-job-abc".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiting(reason: &str) -> ContainerStatus {
        ContainerStatus {
            name: "container".into(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.into()),
                    message: Some("back-off pulling image".into()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(code: i32) -> ContainerStatus {
        ContainerStatus {
            name: "container".into(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: code,
                    reason: Some("Error".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn controller(cluster: MockClusterClient) -> Arc<dyn PodController> {
        let config = EngineConfig {
            controller_namespace: "bulwark".into(),
            service_account: String::new(),
            poll_backoff: Backoff::fixed(Duration::from_secs(1)),
            pod_ready_timeout: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        KubePodControllerFactory::new(Arc::new(cluster), &config)
            .controller(PodOptions::job("shop", "busybox", vec!["true".into()]))
    }

    #[test]
    fn running_and_finished_pods_are_ready() {
        assert!(matches!(
            ready_state("ns", "p", &pod_in("Running", vec![])),
            Ok(Poll::Ready(()))
        ));
        assert!(matches!(
            ready_state("ns", "p", &pod_in("Failed", vec![])),
            Ok(Poll::Ready(()))
        ));
        assert!(matches!(
            ready_state("ns", "p", &pod_in("Pending", vec![])),
            Ok(Poll::Pending(Some(_)))
        ));
    }

    #[test]
    fn image_pull_failure_is_not_ready() {
        let err = ready_state("ns", "p", &pod_in("Pending", vec![waiting("ImagePullBackOff")]))
            .expect_err("pull back-off should fail readiness");
        assert!(matches!(err, Error::PodNotReady { .. }));
        assert!(err.to_string().contains("ImagePullBackOff"));

        let creating = pod_in("Pending", vec![waiting("ContainerCreating")]);
        assert!(ready_state("ns", "p", &creating).is_ok());
    }

    #[test]
    fn completion_detects_failures() {
        assert!(matches!(
            completion_state("ns", "p", &pod_in("Succeeded", vec![])),
            Ok(Poll::Ready(()))
        ));
        assert!(matches!(
            completion_state("ns", "p", &pod_in("Running", vec![])),
            Ok(Poll::Pending(None))
        ));

        let err = completion_state("ns", "p", &pod_in("Running", vec![terminated(2)]))
            .expect_err("non-zero exit should fail");
        assert!(err.to_string().contains("exit code 2"));

        let err = completion_state("ns", "p", &pod_in("Failed", vec![]))
            .expect_err("failed pod should fail");
        assert!(err.to_string().contains("ns/p"));
    }

    /// Story: A job pod is created, becomes ready, and is deleted.
    #[tokio::test(start_paused = true)]
    async fn story_controller_drives_pod_lifecycle() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_create_pod()
            .withf(|ns, pod| {
                ns == "shop" && pod.metadata.generate_name.as_deref() == Some("bulwark-job-")
            })
            .returning(|_, pod| {
                let mut created = pod.clone();
                created.metadata.name = Some("bulwark-job-abc".into());
                Ok(created)
            });
        let mut polls = 0;
        cluster.expect_get_pod().returning(move |_, _| {
            polls += 1;
            Ok(pod_in(if polls < 3 { "Pending" } else { "Running" }, vec![]))
        });
        cluster
            .expect_delete_pod()
            .withf(|ns, name, grace| {
                ns == "shop" && name == "bulwark-job-abc" && *grace == Some(Duration::from_secs(5))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let pc = controller(cluster);
        assert_eq!(pc.pod_name(), None);
        let name = pc.start_pod().await.expect("pod should start");
        assert_eq!(name, "bulwark-job-abc");
        assert_eq!(pc.pod_name().as_deref(), Some("bulwark-job-abc"));

        pc.wait_for_pod_ready(&CancellationToken::new())
            .await
            .expect("pod should become ready");
        pc.stop_pod(Some(Duration::from_secs(5)))
            .await
            .expect("pod should be deleted");
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_is_pod_not_ready() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_create_pod().returning(|_, pod| {
            let mut created = pod.clone();
            created.metadata.name = Some("bulwark-job-slow".into());
            Ok(created)
        });
        cluster
            .expect_get_pod()
            .returning(|_, _| Ok(pod_in("Pending", vec![])));

        let pc = controller(cluster);
        pc.start_pod().await.expect("pod should start");
        let err = pc
            .wait_for_pod_ready(&CancellationToken::new())
            .await
            .expect_err("pending pod should time out");
        match err {
            Error::PodNotReady { pod, message, .. } => {
                assert_eq!(pod, "bulwark-job-slow");
                assert!(message.contains("Pending"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn operations_before_start_fail() {
        let pc = controller(MockClusterClient::new());
        assert!(pc.stream_pod_logs().await.is_err());
        assert!(pc.stop_pod(None).await.is_err());
    }
}
