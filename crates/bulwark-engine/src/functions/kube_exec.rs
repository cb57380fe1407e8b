use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::args::{arg, optional_arg, Args};
use crate::context::ExecContext;
use crate::function::{Function, PhaseProgress, ProgressCell};
use crate::output::{parse_output_text, LogSource, Output};
use crate::param::TemplateParams;
use crate::{Error, Result};

const NAME: &str = "KubeExec";
const ARG_NAMESPACE: &str = "namespace";
const ARG_POD: &str = "pod";
const ARG_CONTAINER: &str = "container";
const ARG_COMMAND: &str = "command";

/// Run a command in a container of an existing pod
///
/// Phase outputs printed to stdout become the phase's output. A non-zero
/// exit fails the phase with both streams attached.
#[derive(Debug, Default)]
pub struct KubeExec {
    progress: ProgressCell,
}

impl KubeExec {
    async fn run(&self, ctx: &ExecContext, args: &Args) -> Result<Output> {
        let namespace: String = arg(args, ARG_NAMESPACE)?;
        let pod: String = arg(args, ARG_POD)?;
        let container: String = optional_arg(args, ARG_CONTAINER, String::new())?;
        let command: Vec<String> = arg(args, ARG_COMMAND)?;
        if command.is_empty() {
            return Err(Error::invalid_arg(ARG_COMMAND, "command must not be empty"));
        }

        debug!(namespace = %namespace, pod = %pod, container = %container, "exec in pod");
        if ctx.is_cancelled() {
            return Err(Error::cancelled(format!("exec in pod {namespace}/{pod}")));
        }
        let target = (!container.is_empty()).then(|| container.clone());
        let output = tokio::select! {
            _ = ctx.cancel_token().cancelled() => {
                return Err(Error::cancelled(format!("exec in pod {namespace}/{pod}")));
            }
            output = ctx.cluster().exec(&namespace, &pod, target, command) => output?,
        };

        if output.exit_code != 0 {
            return Err(Error::execution(
                format!("exec in pod {namespace}/{pod} container {container:?}"),
                format!(
                    "exit code {}\nstdout: {}\nstderr: {}",
                    output.exit_code,
                    output.stdout.trim_end(),
                    output.stderr.trim_end()
                ),
            ));
        }
        parse_output_text(&output.stdout, LogSource::new(namespace, pod, container))
    }
}

#[async_trait]
impl Function for KubeExec {
    fn name(&self) -> &str {
        NAME
    }

    fn required_args(&self) -> &[&str] {
        &[ARG_NAMESPACE, ARG_POD, ARG_COMMAND]
    }

    fn arguments(&self) -> &[&str] {
        &[ARG_NAMESPACE, ARG_POD, ARG_CONTAINER, ARG_COMMAND]
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
