//! Execution context handed to every function

use std::sync::Arc;
use std::time::Duration;

use bulwark_common::kube_utils::{controller_namespace, controller_service_account};
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::pod::PodControllerFactory;
use crate::poll::Backoff;

/// Default number of fan-out targets processed at once
pub const DEFAULT_FANOUT_LIMIT: usize = 8;

/// Engine-wide settings
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Namespace the controller runs in; pods default to it
    pub controller_namespace: String,
    /// Service account pods default to
    pub service_account: String,
    /// Maximum concurrent fan-out targets
    pub fanout_limit: usize,
    /// Poll schedule for readiness and condition checks
    pub poll_backoff: Backoff,
    /// Grace period when stopping a pod the engine created
    pub pod_stop_grace: Duration,
    /// How long a pod may take to become ready
    pub pod_ready_timeout: Duration,
    /// Upper bound on a pod running to completion
    pub pod_completion_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller_namespace: controller_namespace(),
            service_account: controller_service_account(),
            fanout_limit: DEFAULT_FANOUT_LIMIT,
            poll_backoff: Backoff::default(),
            pod_stop_grace: Duration::from_secs(30),
            pod_ready_timeout: Duration::from_secs(15 * 60),
            pod_completion_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Cancellation, cluster access and settings for one function call
#[derive(Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    cluster: Arc<dyn ClusterClient>,
    pods: Arc<dyn PodControllerFactory>,
    config: Arc<EngineConfig>,
}

impl ExecContext {
    /// Create a root context
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        pods: Arc<dyn PodControllerFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cancel: CancellationToken::new(),
            cluster,
            pods,
            config: Arc::new(config),
        }
    }

    /// Replace the cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A context cancelled along with this one, that can also be cancelled alone
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Cancellation token
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cluster access
    pub fn cluster(&self) -> &Arc<dyn ClusterClient> {
        &self.cluster
    }

    /// Pod controller factory
    pub fn pods(&self) -> &Arc<dyn PodControllerFactory> {
        &self.pods
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Namespace to use when an argument leaves it empty
    pub fn namespace_or_default(&self, namespace: &str) -> String {
        if namespace.is_empty() {
            self.config.controller_namespace.clone()
        } else {
            namespace.to_string()
        }
    }
}
