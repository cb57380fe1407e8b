//! Controller runner - wires the ActionSet controller to the API server

use std::sync::Arc;

use bulwark_common::crd::{ActionSet, Blueprint, Profile};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use crate::controller::{error_policy, reconcile, Context};
use crate::error::OperatorError;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Every CRD the operator serves
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![ActionSet::crd(), Blueprint::crd(), Profile::crd()]
}

/// Install or update the operator's CRDs with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> Result<(), OperatorError> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(bulwark_common::FIELD_MANAGER).force();

    for crd in crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }
    tracing::info!("all Bulwark CRDs installed/updated");
    Ok(())
}

/// Run the ActionSet controller until a shutdown signal arrives
///
/// ActionSets still executing when the controller stops are cancelled.
pub async fn run_actionset_controller(client: Client, ctx: Arc<Context>) {
    let actionsets: Api<ActionSet> = Api::all(client);
    tracing::info!("- ActionSet controller");

    Controller::new(
        actionsets,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx.clone())
    .for_each(log_reconcile_result("ActionSet"))
    .await;

    ctx.in_flight.cancel_all();
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_share_the_bulwark_group() {
        let crds = crds();
        let names: Vec<_> = crds
            .iter()
            .filter_map(|c| c.metadata.name.as_deref())
            .collect();
        assert_eq!(
            names,
            vec![
                "actionsets.cr.bulwark.dev",
                "blueprints.cr.bulwark.dev",
                "profiles.cr.bulwark.dev"
            ]
        );
        assert!(crds
            .iter()
            .all(|c| c.spec.group == bulwark_common::BULWARK_GROUP));
    }

    #[test]
    fn actionset_crd_is_namespaced_with_status() {
        let crd = ActionSet::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
