use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Map;
use tracing::{debug, instrument};

use super::string_map_arg;
use crate::args::{arg, check_args, optional_arg, Args};
use crate::context::ExecContext;
use crate::function::{Function, PhaseProgress, ProgressCell};
use crate::output::{log_and_parse, LogSource, Output};
use crate::param::TemplateParams;
use crate::pod::{combine_overrides, PodOptions, PodRunner, PvcMount, DEFAULT_CONTAINER_NAME};
use crate::{Error, Result};

const NAME: &str = "PrepareData";
const ARG_NAMESPACE: &str = "namespace";
const ARG_IMAGE: &str = "image";
const ARG_COMMAND: &str = "command";
const ARG_VOLUMES: &str = "volumes";
const ARG_SERVICE_ACCOUNT: &str = "serviceaccount";
const ARG_FAIL_ON_ERROR: &str = "failOnError";
const ARG_POD_OVERRIDE: &str = "podOverride";
const ARG_POD_ANNOTATIONS: &str = "podAnnotations";
const ARG_POD_LABELS: &str = "podLabels";

const POD_PREFIX: &str = "prepare-data-job-";
const DEFAULT_MOUNT_ROOT: &str = "/mnt/prepare_data";
const READ_ONLY_MANY: &str = "ReadOnlyMany";

/// Run a command in a new pod with claims mounted, such as to seed or
/// inspect a volume before a restore
///
/// `volumes` maps claim name to mount path. Left empty, every claim of the
/// target StatefulSet or Deployment is mounted under `/mnt/prepare_data`.
/// The pod's exit status is only checked when `failOnError` is set.
#[derive(Debug, Default)]
pub struct PrepareData {
    progress: ProgressCell,
}

/// Claims of the target workload, each at `/mnt/prepare_data/<claim>`
fn workload_volumes(params: &TemplateParams) -> Result<BTreeMap<String, String>> {
    let workload = params
        .workload()
        .ok_or_else(|| Error::invalid_arg(ARG_VOLUMES, "not set and no workload target"))?;
    let volumes: BTreeMap<_, _> = workload
        .persistent_volume_claims
        .values()
        .flat_map(|claims| claims.keys())
        .map(|claim| (claim.clone(), format!("{DEFAULT_MOUNT_ROOT}/{claim}")))
        .collect();
    if volumes.is_empty() {
        return Err(Error::invalid_arg(
            ARG_VOLUMES,
            format!("workload {} has no volumes", workload.name),
        ));
    }
    Ok(volumes)
}

impl PrepareData {
    async fn pod_options(
        &self,
        ctx: &ExecContext,
        params: &TemplateParams,
        args: &Args,
    ) -> Result<PodOptions> {
        let namespace: String = arg(args, ARG_NAMESPACE)?;
        let image: String = arg(args, ARG_IMAGE)?;
        let command: Vec<String> = arg(args, ARG_COMMAND)?;
        let mut volumes: BTreeMap<String, String> =
            optional_arg(args, ARG_VOLUMES, BTreeMap::new())?;
        if volumes.is_empty() {
            volumes = workload_volumes(params)?;
        }
        let blueprint_override: Map<_, _> = optional_arg(args, ARG_POD_OVERRIDE, Map::new())?;

        let mut options = PodOptions::job(&namespace, image, command);
        options.generate_name = POD_PREFIX.to_string();
        options.service_account = optional_arg(args, ARG_SERVICE_ACCOUNT, String::new())?;

        // Every claim must exist before the pod is created
        for (claim, mount_path) in volumes {
            let pvc = ctx.cluster().get_pvc(&namespace, &claim).await?;
            let read_only = pvc
                .spec
                .and_then(|spec| spec.access_modes)
                .is_some_and(|modes| modes.iter().any(|m| m == READ_ONLY_MANY));
            debug!(%namespace, %claim, %mount_path, read_only, "mounting claim");
            options.volumes.insert(claim, PvcMount { mount_path, read_only });
        }

        let actionset_override: Map<_, _> = params.pod_override.clone().into_iter().collect();
        options.pod_override = combine_overrides(&blueprint_override, &actionset_override);

        options.labels = params.pod_labels.clone();
        options.labels.extend(string_map_arg(args, ARG_POD_LABELS)?);
        options.annotations = params.pod_annotations.clone();
        options.annotations.extend(string_map_arg(args, ARG_POD_ANNOTATIONS)?);
        Ok(options)
    }

    async fn run(&self, ctx: &ExecContext, params: &TemplateParams, args: &Args) -> Result<Output> {
        let options = self.pod_options(ctx, params, args).await?;
        let fail_on_error: bool = optional_arg(args, ARG_FAIL_ON_ERROR, false)?;
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
                if fail_on_error {
                    pod.wait_for_pod_completion(cancel).await?;
                }
                Ok(output)
            })
            .await
    }
}

#[async_trait]
impl Function for PrepareData {
    fn name(&self) -> &str {
        NAME
    }

    fn required_args(&self) -> &[&str] {
        &[ARG_NAMESPACE, ARG_IMAGE, ARG_COMMAND]
    }

    fn arguments(&self) -> &[&str] {
        &[
            ARG_NAMESPACE,
            ARG_IMAGE,
            ARG_COMMAND,
            ARG_VOLUMES,
            ARG_SERVICE_ACCOUNT,
            ARG_POD_OVERRIDE,
            ARG_POD_ANNOTATIONS,
            ARG_POD_LABELS,
            ARG_FAIL_ON_ERROR,
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
