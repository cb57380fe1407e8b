use async_trait::async_trait;
use tracing::{info, instrument};

use super::split_fields;
use crate::args::{arg, Args};
use crate::context::ExecContext;
use crate::fanout::FanOut;
use crate::function::{Function, PhaseProgress, ProgressCell};
use crate::output::Output;
use crate::param::TemplateParams;
use crate::{Error, Result};

const NAME: &str = "KubeExecAll";
const ARG_NAMESPACE: &str = "namespace";
const ARG_PODS: &str = "pods";
const ARG_CONTAINERS: &str = "containers";
const ARG_COMMAND: &str = "command";

/// Run one command in every listed container of every listed pod
///
/// `pods` and `containers` are space-separated lists. The phase fails if
/// any target fails, with one message per failed target.
#[derive(Debug, Default)]
pub struct KubeExecAll {
    progress: ProgressCell,
}

impl KubeExecAll {
    async fn run(&self, ctx: &ExecContext, args: &Args) -> Result<Output> {
        let namespace: String = arg(args, ARG_NAMESPACE)?;
        let pods = split_fields(&arg::<String>(args, ARG_PODS)?);
        let containers = split_fields(&arg::<String>(args, ARG_CONTAINERS)?);
        let command: Vec<String> = arg(args, ARG_COMMAND)?;
        if pods.is_empty() {
            return Err(Error::invalid_arg(ARG_PODS, "no pods listed"));
        }
        if containers.is_empty() {
            return Err(Error::invalid_arg(ARG_CONTAINERS, "no containers listed"));
        }
        if command.is_empty() {
            return Err(Error::invalid_arg(ARG_COMMAND, "command must not be empty"));
        }

        let targets: Vec<String> = pods
            .iter()
            .flat_map(|pod| containers.iter().map(move |c| format!("{pod}/{c}")))
            .collect();
        info!(namespace = %namespace, targets = targets.len(), "exec in all pods");

        let cluster = ctx.cluster().clone();
        FanOut::new(ctx.config().fanout_limit)
            .run(ctx.cancel_token(), targets, |target| {
                let cluster = cluster.clone();
                let namespace = namespace.clone();
                let command = command.clone();
                async move {
                    let (pod, container) = target.split_once('/').unwrap_or((target.as_str(), ""));
                    let output = cluster
                        .exec(&namespace, pod, Some(container.to_string()), command)
                        .await?;
                    if output.exit_code != 0 {
                        return Err(Error::execution(
                            format!("exec in pod {namespace}/{pod} container {container:?}"),
                            format!("exit code {}: {}", output.exit_code, output.stderr.trim_end()),
                        ));
                    }
                    Ok(())
                }
            })
            .await?;
        Ok(Output::new())
    }
}

#[async_trait]
impl Function for KubeExecAll {
    fn name(&self) -> &str {
        NAME
    }

    fn required_args(&self) -> &[&str] {
        &[ARG_NAMESPACE, ARG_PODS, ARG_CONTAINERS, ARG_COMMAND]
    }

    fn arguments(&self) -> &[&str] {
        &[ARG_NAMESPACE, ARG_PODS, ARG_CONTAINERS, ARG_COMMAND]
    }

    #[instrument(skip_all, fields(function = NAME))]
    async fn exec(
        &self,
        ctx: &ExecContext,
        _params: &TemplateParams,
        args: &Args,
    ) -> Result<Output> {
        self.progress.track(self.run(ctx, args)).await
    }

    fn execution_progress(&self) -> Result<PhaseProgress> {
        Ok(self.progress.snapshot())
    }
}
