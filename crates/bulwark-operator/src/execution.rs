//! Running an ActionSet's actions and mirroring progress into status

use std::sync::Arc;

use async_trait::async_trait;
use bulwark_common::crd::{ActionSet, ActionSetSpec, ActionSetStatus, BlueprintAction};
use bulwark_common::retry::{retry_with_backoff_if, RetryConfig};
use bulwark_common::FIELD_MANAGER;
use bulwark_engine::{ExecContext, PhaseExecutor, PhaseObserver, PhaseRecord, TemplateParams};
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::OperatorError;
use crate::status;

/// Where status snapshots are written
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Replace the ActionSet's status with `status`
    async fn write(&self, status: &ActionSetStatus) -> Result<(), OperatorError>;
}

/// Patches `status` of one ActionSet through the API server
pub struct KubeStatusSink {
    api: Api<ActionSet>,
    name: String,
    retry: RetryConfig,
}

impl KubeStatusSink {
    /// Sink for the ActionSet `name` reachable through `api`
    pub fn new(api: Api<ActionSet>, name: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            api,
            name: name.into(),
            retry,
        }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn write(&self, status: &ActionSetStatus) -> Result<(), OperatorError> {
        update_status(&self.api, &self.name, status, &self.retry).await
    }
}

/// Merge-patch the whole status, retrying transient failures
pub async fn update_status(
    api: &Api<ActionSet>,
    name: &str,
    status: &ActionSetStatus,
    retry: &RetryConfig,
) -> Result<(), OperatorError> {
    let body = json!({ "status": status });
    let patch = &Patch::Merge(&body);
    let params = &PatchParams::apply(FIELD_MANAGER);
    retry_with_backoff_if(
        retry,
        "patch_actionset_status",
        || async move {
            api.patch_status(name, params, patch)
                .await
                .map_err(OperatorError::from)
        },
        |e| !e.is_gone(),
    )
    .await?;
    debug!(actionset = %name, state = %status.state, "status updated");
    Ok(())
}

/// Mirrors every phase transition of action `index` into status
struct StatusObserver<'a> {
    index: usize,
    status: &'a Mutex<ActionSetStatus>,
    blueprints: &'a [BlueprintAction],
    sink: &'a dyn StatusSink,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl PhaseObserver for StatusObserver<'_> {
    async fn on_transition(&self, record: &PhaseRecord, deferred: bool) {
        let snapshot = {
            let mut status = self.status.lock();
            if !status::record_phase(&mut status, self.index, record, deferred) {
                warn!(phase = %record.name, "phase missing from status");
                return;
            }
            status::refresh_progress(&mut status, self.blueprints, Utc::now());
            status.clone()
        };

        if let Err(e) = self.sink.write(&snapshot).await {
            if e.is_gone() {
                warn!(phase = %record.name, "ActionSet deleted while running; cancelling");
                self.cancel.cancel();
            } else {
                warn!(phase = %record.name, error = %e, "failed to record phase transition");
            }
        }
    }
}

/// Run each action in order against its blueprint action
///
/// `blueprints` is index-aligned with `spec.actions`. The first failing
/// action stops the rest. The final status is written to `sink` and
/// returned.
#[instrument(skip_all, fields(actions = spec.actions.len()))]
pub async fn run_actionset(
    executor: &PhaseExecutor,
    exec: &ExecContext,
    sink: &dyn StatusSink,
    spec: &ActionSetSpec,
    blueprints: &[BlueprintAction],
    initial: ActionSetStatus,
) -> ActionSetStatus {
    let status = Mutex::new(initial);
    let mut failure = None;

    for (index, (action, blueprint)) in spec.actions.iter().zip(blueprints).enumerate() {
        if exec.is_cancelled() {
            failure = Some(format!("action '{}' cancelled before it started", action.name));
            break;
        }

        let params =
            match TemplateParams::resolve(exec.cluster().as_ref(), action, Utc::now()).await {
                Ok(params) => params,
                Err(e) => {
                    error!(
                        action = %action.name,
                        error = %e,
                        "failed to resolve template parameters"
                    );
                    failure = Some(format!("action '{}': {e}", action.name));
                    break;
                }
            };

        let observer = StatusObserver {
            index,
            status: &status,
            blueprints,
            sink,
            cancel: exec.cancel_token(),
        };
        let run = executor
            .execute(exec, &action.name, blueprint, params, &observer)
            .await;

        status::finish_action(&mut status.lock(), index, &run);
        if let Some(e) = run.error {
            failure = Some(format!("action '{}': {e}", action.name));
            break;
        }
        info!(action = %action.name, artifacts = run.artifacts.len(), "action complete");
    }

    let mut status = status.into_inner();
    status::refresh_progress(&mut status, blueprints, Utc::now());
    status::finish(&mut status, failure, Utc::now());
    if let Err(e) = sink.write(&status).await {
        error!(error = %e, state = %status.state, "failed to record final ActionSet state");
    }
    status
}

/// Cancellation handles of ActionSets currently executing in this process
#[derive(Default)]
pub struct InFlight {
    runs: dashmap::DashMap<String, CancellationToken>,
}

impl InFlight {
    /// Register `key`; false when it is already running
    pub fn start(&self, key: &str, token: CancellationToken) -> bool {
        match self.runs.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    /// Forget `key`
    pub fn finish(&self, key: &str) {
        self.runs.remove(key);
    }

    /// Whether `key` is executing here
    pub fn contains(&self, key: &str) -> bool {
        self.runs.contains_key(key)
    }

    /// Cancel every run
    pub fn cancel_all(&self) {
        for entry in self.runs.iter() {
            entry.value().cancel();
        }
    }
}

/// Removes a run from [`InFlight`] when the task ends, even on panic
pub struct InFlightGuard {
    runs: Arc<InFlight>,
    key: String,
}

impl InFlightGuard {
    /// Guard for `key`, which must already be registered
    pub fn new(runs: Arc<InFlight>, key: impl Into<String>) -> Self {
        Self {
            runs,
            key: key.into(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.runs.finish(&self.key);
    }
}
