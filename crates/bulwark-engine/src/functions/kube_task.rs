use async_trait::async_trait;
use serde_json::Map;
use tracing::instrument;

use super::string_map_arg;
use crate::args::{arg, check_args, optional_arg, Args};
use crate::context::ExecContext;
use crate::function::{Function, PhaseProgress, ProgressCell};
use crate::output::{log_and_parse, LogSource, Output};
use crate::param::TemplateParams;
use crate::pod::{combine_overrides, PodOptions, PodRunner, DEFAULT_CONTAINER_NAME};
use crate::Result;

const NAME: &str = "KubeTask";
const ARG_NAMESPACE: &str = "namespace";
const ARG_IMAGE: &str = "image";
const ARG_COMMAND: &str = "command";
const ARG_POD_OVERRIDE: &str = "podOverride";
const ARG_POD_ANNOTATIONS: &str = "podAnnotations";
const ARG_POD_LABELS: &str = "podLabels";

/// Run a command in a new pod and collect the phase outputs it prints
#[derive(Debug, Default)]
pub struct KubeTask {
    progress: ProgressCell,
}

impl KubeTask {
    fn pod_options(
        &self,
        ctx: &ExecContext,
        params: &TemplateParams,
        args: &Args,
    ) -> Result<PodOptions> {
        let namespace: String = optional_arg(args, ARG_NAMESPACE, String::new())?;
        let image: String = arg(args, ARG_IMAGE)?;
        let command: Vec<String> = arg(args, ARG_COMMAND)?;
        let blueprint_override: Map<_, _> = optional_arg(args, ARG_POD_OVERRIDE, Map::new())?;

        let mut options = PodOptions::job(ctx.namespace_or_default(&namespace), image, command);
        if namespace.is_empty() {
            options.service_account = ctx.config().service_account.clone();
        }

        // ActionSet override wins over the blueprint's
        let actionset_override: Map<_, _> = params.pod_override.clone().into_iter().collect();
        options.pod_override = combine_overrides(&blueprint_override, &actionset_override);

        // Blueprint labels and annotations win over the ActionSet's
        options.labels = params.pod_labels.clone();
        options.labels.extend(string_map_arg(args, ARG_POD_LABELS)?);
        options.annotations = params.pod_annotations.clone();
        options.annotations.extend(string_map_arg(args, ARG_POD_ANNOTATIONS)?);
        Ok(options)
    }

    async fn run(&self, ctx: &ExecContext, params: &TemplateParams, args: &Args) -> Result<Output> {
        let options = self.pod_options(ctx, params, args)?;
        let runner = PodRunner::new(ctx.pods().controller(options), ctx.config().pod_stop_grace);
        let cancel = ctx.cancel_token();
        runner
            .run(cancel, |pod| async move {
                let logs = pod.stream_pod_logs().await?;
                let source = LogSource::new(
                    pod.namespace(),
                    pod.pod_name().unwrap_or_default(),
                    DEFAULT_CONTAINER_NAME,
                );
                let output = log_and_parse(logs, source).await?;
                pod.wait_for_pod_completion(cancel).await?;
                Ok(output)
            })
            .await
    }
}

#[async_trait]
impl Function for KubeTask {
    fn name(&self) -> &str {
        NAME
    }

    fn required_args(&self) -> &[&str] {
        &[ARG_IMAGE, ARG_COMMAND]
    }

    fn arguments(&self) -> &[&str] {
        &[
            ARG_NAMESPACE,
            ARG_IMAGE,
            ARG_COMMAND,
            ARG_POD_OVERRIDE,
            ARG_POD_ANNOTATIONS,
            ARG_POD_LABELS,
        ]
    }

    fn validate(&self, args: &Args) -> Result<()> {
        check_args(NAME, args, self.required_args(), self.arguments())?;
        string_map_arg(args, ARG_POD_LABELS)?;
        string_map_arg(args, ARG_POD_ANNOTATIONS)?;
        Ok(())
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
