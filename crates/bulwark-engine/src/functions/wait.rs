use async_trait::async_trait;
use tracing::instrument;

use super::parse_duration;
use crate::args::{arg, Args};
use crate::context::ExecContext;
use crate::function::{Function, PhaseProgress, ProgressCell};
use crate::output::Output;
use crate::param::TemplateParams;
use crate::waiter::{ConditionSyntax, ConditionWaiter, WaitConditions};
use crate::Result;

const ARG_TIMEOUT: &str = "timeout";
const ARG_CONDITIONS: &str = "conditions";
const ARGS: &[&str] = &[ARG_TIMEOUT, ARG_CONDITIONS];

async fn wait(
    ctx: &ExecContext,
    params: &TemplateParams,
    args: &Args,
    syntax: ConditionSyntax,
) -> Result<Output> {
    let timeout = parse_duration(&arg::<String>(args, ARG_TIMEOUT)?)?;
    let conditions: WaitConditions = arg(args, ARG_CONDITIONS)?;
    ConditionWaiter::new(ctx.cluster().clone(), ctx.config().poll_backoff)
        .wait(&conditions, timeout, params, syntax, ctx.cancel_token())
        .await?;
    Ok(Output::new())
}

/// Wait for conditions written with `{$.jsonpath}` placeholders
///
/// ```yaml
/// func: Wait
/// args:
///   timeout: 5m
///   conditions:
///     anyOf:
///       - condition: '{{ if eq "{$.status.phase}" "Running" }}true{{ end }}'
///         objectReference:
///           apiVersion: v1
///           resource: pods
///           name: "{{ .Options.pod }}"
///           namespace: "{{ .Namespace.Name }}"
/// ```
#[derive(Debug, Default)]
pub struct Wait {
    progress: ProgressCell,
}

#[async_trait]
impl Function for Wait {
    fn name(&self) -> &str {
        "Wait"
    }

    fn required_args(&self) -> &[&str] {
        ARGS
    }

    fn arguments(&self) -> &[&str] {
        ARGS
    }

    #[instrument(skip_all, fields(function = "Wait"))]
    async fn exec(
        &self,
        ctx: &ExecContext,
        params: &TemplateParams,
        args: &Args,
    ) -> Result<Output> {
        self.progress
            .track(wait(ctx, params, args, ConditionSyntax::JsonPath))
            .await
    }

    fn execution_progress(&self) -> Result<PhaseProgress> {
        Ok(self.progress.snapshot())
    }

    fn skip_arg_render(&self) -> bool {
        true
    }
}

/// Wait for conditions written as templates over the fetched object
///
/// The condition renders against the object itself (`{{ .status.phase }}`);
/// the object reference renders against the action's parameters.
#[derive(Debug, Default)]
pub struct WaitV2 {
    progress: ProgressCell,
}

#[async_trait]
impl Function for WaitV2 {
    fn name(&self) -> &str {
        "WaitV2"
    }

    fn required_args(&self) -> &[&str] {
        ARGS
    }

    fn arguments(&self) -> &[&str] {
        ARGS
    }

    #[instrument(skip_all, fields(function = "WaitV2"))]
    async fn exec(
        &self,
        ctx: &ExecContext,
        params: &TemplateParams,
        args: &Args,
    ) -> Result<Output> {
        self.progress
            .track(wait(ctx, params, args, ConditionSyntax::GoTemplate))
            .await
    }

    fn execution_progress(&self) -> Result<PhaseProgress> {
        Ok(self.progress.snapshot())
    }

    fn skip_arg_render(&self) -> bool {
        true
    }
}
