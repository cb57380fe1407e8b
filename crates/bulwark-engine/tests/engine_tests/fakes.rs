//! In-memory stand-ins for the cluster and for pod lifecycles

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_common::crd::{ObjectReference, Profile, State};
use bulwark_engine::cluster::{ClusterClient, ExecOutput, LogStream, Workload, WorkloadKind};
use bulwark_engine::function::Function;
use bulwark_engine::output::Output;
use bulwark_engine::pod::{PodController, PodControllerFactory, PodOptions};
use bulwark_engine::{
    Args, EngineConfig, Error, ExecContext, PhaseObserver, PhaseRecord, Result, TemplateParams,
};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Cluster
// =============================================================================

/// Cluster holding a few objects and workloads; every call is recorded
#[derive(Default)]
pub struct FakeCluster {
    pub objects: Mutex<BTreeMap<String, Value>>,
    pub replicas: Mutex<BTreeMap<String, i32>>,
    pub pvcs: Mutex<BTreeMap<String, PersistentVolumeClaim>>,
    pub exec_stdout: Mutex<String>,
    pub execs: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeCluster {
    fn not_found(what: &str) -> Error {
        Error::execution(format!("get {what}"), "not found")
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_object(&self, obj: &ObjectReference) -> Result<Value> {
        self.objects
            .lock()
            .get(&obj.name)
            .cloned()
            .ok_or_else(|| Self::not_found(&obj.display_name()))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        Err(Self::not_found(&format!("secret {namespace}/{name}")))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        Err(Self::not_found(&format!("configmap {namespace}/{name}")))
    }

    async fn get_profile(&self, namespace: &str, name: &str) -> Result<Profile> {
        Err(Self::not_found(&format!("profile {namespace}/{name}")))
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.pvcs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(&format!("pvc {namespace}/{name}")))
    }

    async fn get_workload(
        &self,
        _kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        let replicas = self.replicas.lock().get(name).copied().unwrap_or(1);
        Ok(Workload {
            name: name.to_string(),
            namespace: namespace.to_string(),
            replicas,
            ready_replicas: replicas,
            selector: String::new(),
        })
    }

    async fn scale_workload(
        &self,
        _kind: WorkloadKind,
        _namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        self.replicas.lock().insert(name.to_string(), replicas);
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        Ok(Vec::new())
    }

    async fn create_pod(&self, namespace: &str, _pod: &Pod) -> Result<Pod> {
        Err(Error::execution(format!("create pod in {namespace}"), "not supported by fake"))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Err(Self::not_found(&format!("pod {namespace}/{name}")))
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        _name: &str,
        _grace: Option<Duration>,
    ) -> Result<()> {
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        _container: Option<String>,
    ) -> Result<LogStream> {
        Err(Self::not_found(&format!("logs of pod {namespace}/{name}")))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: Option<String>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        self.execs
            .lock()
            .push((namespace.to_string(), pod.to_string(), command));
        Ok(ExecOutput {
            stdout: self.exec_stdout.lock().clone(),
            ..Default::default()
        })
    }
}

// =============================================================================
// Pods
// =============================================================================

/// Pod that is ready at once and prints `log` before exiting
pub struct FakePod {
    namespace: String,
    log: String,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl PodController for FakePod {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn pod_name(&self) -> Option<String> {
        Some("bulwark-job-fake".to_string())
    }

    async fn start_pod(&self) -> Result<String> {
        Ok("bulwark-job-fake".to_string())
    }

    async fn wait_for_pod_ready(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn wait_for_pod_completion(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn stream_pod_logs(&self) -> Result<LogStream> {
        let stream: LogStream = Box::pin(futures::io::Cursor::new(self.log.clone().into_bytes()));
        Ok(stream)
    }

    async fn stop_pod(&self, _grace: Option<Duration>) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`FakePod`]s printing `log`, remembering what was asked for
#[derive(Default)]
pub struct FakePods {
    pub log: Mutex<String>,
    pub requested: Mutex<Vec<PodOptions>>,
    pub stopped: Arc<AtomicUsize>,
}

impl PodControllerFactory for FakePods {
    fn controller(&self, options: PodOptions) -> Arc<dyn PodController> {
        let namespace = options.namespace.clone();
        self.requested.lock().push(options);
        Arc::new(FakePod {
            namespace,
            log: self.log.lock().clone(),
            stopped: self.stopped.clone(),
        })
    }
}

// =============================================================================
// Functions and observers
// =============================================================================

/// Function that counts its calls and fails when told to
pub struct Spy {
    name: &'static str,
    fail: bool,
    pub calls: AtomicUsize,
}

impl Spy {
    pub fn ok(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Function for Spy {
    fn name(&self) -> &str {
        self.name
    }

    fn required_args(&self) -> &[&str] {
        &[]
    }

    fn arguments(&self) -> &[&str] {
        &["note"]
    }

    async fn exec(
        &self,
        _ctx: &ExecContext,
        _params: &TemplateParams,
        _args: &Args,
    ) -> Result<Output> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::execution(self.name, "spy told to fail"))
        } else {
            Ok(Output::new())
        }
    }
}

/// Observer keeping every transition in order
#[derive(Default)]
pub struct Transitions(pub Mutex<Vec<(String, State, bool)>>);

impl Transitions {
    pub fn of(&self, phase: &str) -> Vec<State> {
        self.0
            .lock()
            .iter()
            .filter(|(name, _, _)| name == phase)
            .map(|(_, state, _)| *state)
            .collect()
    }
}

#[async_trait]
impl PhaseObserver for Transitions {
    async fn on_transition(&self, record: &PhaseRecord, deferred: bool) {
        self.0.lock().push((record.name.clone(), record.state, deferred));
    }
}

/// Context over the given fakes, polling quickly
pub fn context(cluster: Arc<FakeCluster>, pods: Arc<FakePods>) -> ExecContext {
    ExecContext::new(
        cluster,
        pods,
        EngineConfig {
            controller_namespace: "bulwark".to_string(),
            service_account: "bulwark-runner".to_string(),
            pod_ready_timeout: Duration::from_secs(30),
            ..EngineConfig::default()
        },
    )
}
