//! ActionSet controller implementation
//!
//! Reconciles ActionSet resources through a state machine:
//! (no status) → Pending → Running → Complete/Failed
//!
//! - No status: validate the ActionSet, resolve every blueprint action, and
//!   write a status listing each phase as pending
//! - Pending: mark running and hand the actions to a background task
//! - Running: nothing to do while the task lives; a Running ActionSet with
//!   no task in this process was orphaned by a restart and is failed
//! - Complete/Failed: never run again

use std::sync::Arc;
use std::time::Duration;

use bulwark_common::crd::{ActionSet, ActionSetStatus, Blueprint, BlueprintAction, State};
use bulwark_common::retry::RetryConfig;
use bulwark_engine::{ExecContext, FunctionRegistry, PhaseExecutor};
use chrono::Utc;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

use crate::error::OperatorError;
use crate::execution::{run_actionset, update_status, InFlight, InFlightGuard, KubeStatusSink};
use crate::status;

/// Message recorded on ActionSets found running with no task behind them
pub const ORPHANED_MESSAGE: &str = "controller restarted while the ActionSet was running";

/// Shared context for the ActionSet controller
pub struct Context {
    pub client: Client,
    pub executor: Arc<PhaseExecutor>,
    pub exec: ExecContext,
    pub retry: RetryConfig,
    pub in_flight: Arc<InFlight>,
}

impl Context {
    /// Create a new Context dispatching through `registry`
    pub fn new(client: Client, registry: Arc<FunctionRegistry>, exec: ExecContext) -> Self {
        Self {
            client,
            executor: Arc::new(PhaseExecutor::new(registry)),
            exec,
            retry: RetryConfig::default(),
            in_flight: Arc::new(InFlight::default()),
        }
    }
}

/// Reconcile an ActionSet resource
pub async fn reconcile(
    actionset: Arc<ActionSet>,
    ctx: Arc<Context>,
) -> Result<Action, OperatorError> {
    let name = actionset.name_any();
    let namespace = actionset
        .metadata
        .namespace
        .clone()
        .ok_or(OperatorError::MissingNamespace)?;
    let key = format!("{namespace}/{name}");
    let api: Api<ActionSet> = Api::namespaced(ctx.client.clone(), &namespace);

    match actionset.status.as_ref().map(|s| s.state) {
        None => {
            let blueprints = match prepare(&ctx.client, &namespace, &actionset).await {
                Ok(blueprints) => blueprints,
                Err(e) if e.is_permanent() => {
                    error!(actionset = %key, error = %e, "ActionSet rejected");
                    let failed = status::failed_status(None, e.to_string());
                    update_status(&api, &name, &failed, &ctx.retry).await?;
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e),
            };
            let initial = status::initial_status(&actionset, &blueprints, Utc::now());
            update_status(&api, &name, &initial, &ctx.retry).await?;
            info!(actionset = %key, actions = blueprints.len(), "ActionSet accepted");
            Ok(Action::await_change())
        }
        Some(State::Pending) => {
            if ctx.in_flight.contains(&key) {
                return Ok(Action::await_change());
            }
            let blueprints = match prepare(&ctx.client, &namespace, &actionset).await {
                Ok(blueprints) => blueprints,
                Err(e) if e.is_permanent() => {
                    error!(actionset = %key, error = %e, "ActionSet can no longer run");
                    let failed = status::failed_status(actionset.status.as_ref(), e.to_string());
                    update_status(&api, &name, &failed, &ctx.retry).await?;
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e),
            };
            start(&ctx, api, key, &actionset, blueprints).await?;
            Ok(Action::await_change())
        }
        Some(State::Running) => {
            if ctx.in_flight.contains(&key) {
                return Ok(Action::await_change());
            }
            // The cached copy may predate the task's final write
            let latest = api.get_opt(&name).await?.and_then(|a| a.status);
            if status::is_orphaned(latest.as_ref(), ctx.in_flight.contains(&key)) {
                warn!(actionset = %key, "running ActionSet has no task in this controller");
                let failed = status::failed_status(latest.as_ref(), ORPHANED_MESSAGE);
                update_status(&api, &name, &failed, &ctx.retry).await?;
            }
            Ok(Action::await_change())
        }
        Some(State::Complete) | Some(State::Failed) => Ok(Action::await_change()),
    }
}

/// Validate `spec.actions` and look up each one in its blueprint
async fn prepare(
    client: &Client,
    namespace: &str,
    actionset: &ActionSet,
) -> Result<Vec<BlueprintAction>, OperatorError> {
    actionset.validate()?;
    let blueprints: Api<Blueprint> = Api::namespaced(client.clone(), namespace);

    let mut actions = Vec::with_capacity(actionset.spec.actions.len());
    for spec in &actionset.spec.actions {
        let blueprint = blueprints
            .get_opt(&spec.blueprint)
            .await?
            .ok_or_else(|| OperatorError::BlueprintNotFound {
                namespace: namespace.to_string(),
                name: spec.blueprint.clone(),
            })?;
        let action = blueprint
            .action(&spec.name)
            .cloned()
            .ok_or_else(|| OperatorError::ActionNotFound {
                blueprint: spec.blueprint.clone(),
                action: spec.name.clone(),
            })?;
        actions.push(action);
    }
    Ok(actions)
}

/// Mark the ActionSet running and execute it on a background task
async fn start(
    ctx: &Arc<Context>,
    api: Api<ActionSet>,
    key: String,
    actionset: &ActionSet,
    blueprints: Vec<BlueprintAction>,
) -> Result<(), OperatorError> {
    let name = actionset.name_any();
    let exec = ctx.exec.child();
    if !ctx.in_flight.start(&key, exec.cancel_token().clone()) {
        return Ok(());
    }
    let guard = InFlightGuard::new(ctx.in_flight.clone(), key.clone());

    let mut running: ActionSetStatus = actionset.status.clone().unwrap_or_default();
    running.state = State::Running;
    update_status(&api, &name, &running, &ctx.retry).await?;
    info!(actionset = %key, "ActionSet running");

    let executor = ctx.executor.clone();
    let sink = KubeStatusSink::new(api, name, ctx.retry.clone());
    let spec = actionset.spec.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let done = run_actionset(&executor, &exec, &sink, &spec, &blueprints, running).await;
        match done.error {
            None => info!(actionset = %key, "ActionSet complete"),
            Some(message) => error!(actionset = %key, error = %message, "ActionSet failed"),
        }
    });
    Ok(())
}

/// Error policy for ActionSet reconciliation
pub fn error_policy(
    actionset: Arc<ActionSet>,
    error: &OperatorError,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        actionset = %actionset.name_any(),
        "actionset reconciliation failed"
    );
    Action::requeue(Duration::from_secs(30))
}
