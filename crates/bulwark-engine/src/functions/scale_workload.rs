use async_trait::async_trait;
use tracing::{info, instrument};

use crate::args::{arg, arg_exists, optional_arg, Args};
use crate::cluster::WorkloadKind;
use crate::context::ExecContext;
use crate::function::{Function, PhaseProgress, ProgressCell};
use crate::output::Output;
use crate::param::TemplateParams;
use crate::poll::{poll_until, Poll};
use crate::{Error, Result};

const NAME: &str = "ScaleWorkload";
const ARG_NAMESPACE: &str = "namespace";
const ARG_NAME: &str = "name";
const ARG_KIND: &str = "kind";
const ARG_REPLICAS: &str = "replicas";
const ARG_WAIT_FOR_READY: &str = "waitForReady";

#[derive(Debug, PartialEq)]
struct Target {
    kind: WorkloadKind,
    namespace: String,
    name: String,
    replicas: i32,
    wait_for_ready: bool,
}

impl Target {
    fn from_args(params: &TemplateParams, args: &Args) -> Result<Self> {
        let replicas: i32 = arg(args, ARG_REPLICAS)?;
        if replicas < 0 {
            return Err(Error::invalid_arg(ARG_REPLICAS, format!("{replicas} is negative")));
        }

        let (kind, namespace, name) = if let Some(ss) = &params.stateful_set {
            ("statefulset", ss.namespace.clone(), ss.name.clone())
        } else if let Some(deploy) = &params.deployment {
            ("deployment", deploy.namespace.clone(), deploy.name.clone())
        } else {
            if let Some(missing) = [ARG_NAMESPACE, ARG_NAME, ARG_KIND]
                .into_iter()
                .find(|key| !arg_exists(args, key))
            {
                return Err(Error::invalid_arg(
                    missing,
                    "workload is not the action's target; namespace, name and kind are required",
                ));
            }
            ("", String::new(), String::new())
        };

        let kind_name: String = optional_arg(args, ARG_KIND, kind.to_string())?;
        let kind = WorkloadKind::parse(&kind_name).ok_or_else(|| {
            Error::invalid_arg(ARG_KIND, format!("unsupported workload kind {kind_name:?}"))
        })?;
        Ok(Self {
            kind,
            namespace: optional_arg(args, ARG_NAMESPACE, namespace)?,
            name: optional_arg(args, ARG_NAME, name)?,
            replicas,
            wait_for_ready: optional_arg(args, ARG_WAIT_FOR_READY, true)?,
        })
    }
}

/// Scale a StatefulSet or Deployment, by default waiting until the
/// requested replicas are running and ready
#[derive(Debug, Default)]
pub struct ScaleWorkload {
    progress: ProgressCell,
}

impl ScaleWorkload {
    async fn run(&self, ctx: &ExecContext, params: &TemplateParams, args: &Args) -> Result<Output> {
        let target = Target::from_args(params, args)?;
        let cluster = ctx.cluster();
        cluster
            .scale_workload(target.kind, &target.namespace, &target.name, target.replicas)
            .await?;
        info!(
            kind = %target.kind,
            namespace = %target.namespace,
            name = %target.name,
            replicas = target.replicas,
            "workload scaled"
        );
        if !target.wait_for_ready {
            return Ok(Output::new());
        }

        let what = format!(
            "{} {}/{} to reach {} replicas",
            target.kind, target.namespace, target.name, target.replicas
        );
        let target = &target;
        poll_until(
            ctx.cancel_token(),
            ctx.config().pod_ready_timeout,
            ctx.config().poll_backoff,
            &what,
            || async move {
                let workload = cluster
                    .get_workload(target.kind, &target.namespace, &target.name)
                    .await?;
                if workload.ready_replicas != target.replicas {
                    return Ok(Poll::Pending(Some(format!(
                        "{} of {} replicas ready",
                        workload.ready_replicas, target.replicas
                    ))));
                }
                // Terminating pods still count until they are gone
                if !workload.selector.is_empty() {
                    let pods = cluster.list_pods(&target.namespace, &workload.selector).await?;
                    if pods.len() != target.replicas as usize {
                        return Ok(Poll::Pending(Some(format!(
                            "{} pods present, want {}",
                            pods.len(),
                            target.replicas
                        ))));
                    }
                }
                Ok(Poll::Ready(()))
            },
        )
        .await?;
        Ok(Output::new())
    }
}

#[async_trait]
impl Function for ScaleWorkload {
    fn name(&self) -> &str {
        NAME
    }

    fn required_args(&self) -> &[&str] {
        &[ARG_REPLICAS]
    }

    fn arguments(&self) -> &[&str] {
        &[ARG_REPLICAS, ARG_NAMESPACE, ARG_NAME, ARG_KIND, ARG_WAIT_FOR_READY]
    }

    #[instrument(skip_all, fields(function = NAME))]
    async fn exec(
        &self,
        ctx: &ExecContext,
        params: &TemplateParams,
        args: &Args,
    ) -> Result<Output> {
        self.progress.track(self.run(ctx, params, args)).await
    }

    fn execution_progress(&self) -> Result<PhaseProgress> {
        Ok(self.progress.snapshot())
    }
}
