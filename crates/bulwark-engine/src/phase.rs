//! Sequential execution of a blueprint action's phases
//!
//! Phases run strictly in blueprint order; each sees the outputs of the
//! phases before it under `.Phases.<name>.Output`. The first failure stops
//! the action. A declared defer phase runs afterwards regardless.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bulwark_common::crd::{Artifact, BlueprintAction, BlueprintPhase, State};
use bulwark_common::template::TemplateEngine;
use tracing::{error, info, instrument, warn};

use crate::args::Args;
use crate::context::ExecContext;
use crate::function::{Function, PhaseProgress};
use crate::output::Output;
use crate::param::{render_args, render_artifacts, render_object_refs, TemplateParams};
use crate::registry::FunctionRegistry;
use crate::{Error, Result};

/// Outcome of one phase
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseRecord {
    /// Phase name
    pub name: String,
    /// Function the phase invokes
    pub function: String,
    /// Where the phase is in its lifecycle
    pub state: State,
    /// Output captured on completion
    pub output: Output,
    /// Last progress reported by the function
    pub progress: Option<PhaseProgress>,
    /// Failure message, set when the phase failed
    pub error: Option<String>,
}

impl PhaseRecord {
    fn pending(phase: &BlueprintPhase) -> Self {
        Self {
            name: phase.name.clone(),
            function: phase.func.clone(),
            state: State::Pending,
            output: Output::new(),
            progress: None,
            error: None,
        }
    }
}

/// Receives phase state transitions as they happen
#[async_trait]
pub trait PhaseObserver: Send + Sync {
    /// `record` has just changed state; `deferred` marks the defer phase
    async fn on_transition(&self, record: &PhaseRecord, deferred: bool);
}

/// Observer that ignores every transition
pub struct NoopObserver;

#[async_trait]
impl PhaseObserver for NoopObserver {
    async fn on_transition(&self, _: &PhaseRecord, _: bool) {}
}

/// Result of running one action
#[derive(Debug)]
pub struct ActionRun {
    /// Regular phases in blueprint order
    pub phases: Vec<PhaseRecord>,
    /// The defer phase, if declared
    pub deferred: Option<PhaseRecord>,
    /// Rendered output artifacts; empty unless the action completed
    pub artifacts: BTreeMap<String, Artifact>,
    /// Template parameters after the last phase
    pub params: TemplateParams,
    /// First error, if the action failed
    pub error: Option<Error>,
}

impl ActionRun {
    /// Complete or Failed
    pub fn state(&self) -> State {
        if self.error.is_some() {
            State::Failed
        } else {
            State::Complete
        }
    }

    /// The phase the action failed in, if any
    pub fn failed_phase(&self) -> Option<&PhaseRecord> {
        self.phases
            .iter()
            .chain(self.deferred.iter())
            .find(|p| p.state == State::Failed)
    }
}

struct Planned<'a> {
    phase: &'a BlueprintPhase,
    function: Arc<dyn Function>,
}

/// Runs blueprint actions against a function registry
pub struct PhaseExecutor {
    registry: Arc<FunctionRegistry>,
    engine: TemplateEngine,
}

impl PhaseExecutor {
    /// Executor dispatching through `registry`
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            registry,
            engine: TemplateEngine::strict(),
        }
    }

    /// Run every phase of `action`, then its defer phase and output artifacts
    #[instrument(skip_all, fields(action = %action_name, phases = action.phases.len()))]
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        action_name: &str,
        action: &BlueprintAction,
        mut params: TemplateParams,
        observer: &dyn PhaseObserver,
    ) -> ActionRun {
        let mut run = ActionRun {
            phases: action.phases.iter().map(PhaseRecord::pending).collect(),
            deferred: action.defer_phase.as_ref().map(PhaseRecord::pending),
            artifacts: BTreeMap::new(),
            params: TemplateParams::default(),
            error: None,
        };

        let (planned, deferred) = match self.plan(action) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "action references an unknown function");
                run.error = Some(e);
                run.params = params;
                return run;
            }
        };

        for (index, step) in planned.iter().enumerate() {
            let result = self
                .run_step(ctx, step, &mut params, &mut run.phases[index], false, observer)
                .await;
            if let Err(e) = result {
                run.error = Some(e);
                break;
            }
        }

        if let (Some(step), Some(record)) = (deferred.as_ref(), run.deferred.as_mut()) {
            let result = self.run_step(ctx, step, &mut params, record, true, observer).await;
            if let Err(e) = result {
                if run.error.is_some() {
                    warn!(error = %e, "defer phase failed after an earlier failure");
                } else {
                    run.error = Some(e);
                }
            }
        }

        if run.error.is_none() {
            match render_artifacts(&self.engine, &action.output_artifacts, &params) {
                Ok(artifacts) => run.artifacts = artifacts,
                Err(e) => {
                    error!(error = %e, "failed to render output artifacts");
                    run.error = Some(e);
                }
            }
        }

        match &run.error {
            None => info!(artifacts = run.artifacts.len(), "action complete"),
            Some(e) => error!(error = %e, "action failed"),
        }
        run.params = params;
        run
    }

    // Resolve every function before anything runs
    fn plan<'a>(
        &self,
        action: &'a BlueprintAction,
    ) -> Result<(Vec<Planned<'a>>, Option<Planned<'a>>)> {
        let lookup = |phase: &'a BlueprintPhase| -> Result<Planned<'a>> {
            let function = self.registry.lookup(&phase.func).ok_or_else(|| {
                Error::FunctionNotFound {
                    name: phase.func.clone(),
                }
                .in_phase(&phase.name, &phase.func)
            })?;
            Ok(Planned { phase, function })
        };
        let planned = action.phases.iter().map(lookup).collect::<Result<Vec<_>>>()?;
        let deferred = action.defer_phase.as_ref().map(lookup).transpose()?;
        Ok((planned, deferred))
    }

    async fn run_step(
        &self,
        ctx: &ExecContext,
        step: &Planned<'_>,
        params: &mut TemplateParams,
        record: &mut PhaseRecord,
        deferred: bool,
        observer: &dyn PhaseObserver,
    ) -> Result<()> {
        let phase = &step.phase.name;
        let function = step.function.name().to_string();

        record.state = State::Running;
        observer.on_transition(record, deferred).await;
        info!(phase = %phase, function = %function, deferred, "executing phase");

        let result = self.run_phase(ctx, step, params).await;
        record.progress = step.function.execution_progress().ok();

        match result {
            Ok(output) => {
                if deferred {
                    params.set_defer_output(output.clone());
                } else {
                    params.set_phase_output(phase, output.clone());
                }
                record.state = State::Complete;
                record.output = output;
                observer.on_transition(record, deferred).await;
                info!(
                    phase = %phase,
                    function = %function,
                    outputs = record.output.len(),
                    "phase complete"
                );
                Ok(())
            }
            Err(e) => {
                let e = e.in_phase(phase, &function);
                record.state = State::Failed;
                record.error = Some(e.to_string());
                observer.on_transition(record, deferred).await;
                error!(phase = %phase, function = %function, error = %e, "phase failed");
                Err(e)
            }
        }
    }

    async fn run_phase(
        &self,
        ctx: &ExecContext,
        step: &Planned<'_>,
        params: &mut TemplateParams,
    ) -> Result<Output> {
        let phase = step.phase;
        let function = &step.function;

        let refs = render_object_refs(&self.engine, &phase.object_refs, params)?;
        let secrets = TemplateParams::phase_secrets(ctx.cluster().as_ref(), &refs).await?;
        params.init_phase(&phase.name, secrets);

        let raw: Args = phase.args.clone().into_iter().collect();
        let args = if function.skip_arg_render() {
            raw
        } else {
            render_args(&self.engine, &raw, params)?
        };
        function.validate(&args)?;

        if ctx.is_cancelled() {
            return Err(Error::cancelled(format!("starting phase {}", phase.name)));
        }
        let child = ctx.child();
        function.exec(&child, params, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::context::EngineConfig;
    use crate::pod::MockPodControllerFactory;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Function for Echo {
        fn name(&self) -> &str {
            "Echo"
        }
        fn required_args(&self) -> &[&str] {
            &["message"]
        }
        fn arguments(&self) -> &[&str] {
            &["message"]
        }
        async fn exec(&self, _: &ExecContext, _: &TemplateParams, args: &Args) -> Result<Output> {
            Ok(Output::from([("message".to_string(), args["message"].clone())]))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, State, bool)>>);

    #[async_trait]
    impl PhaseObserver for Recorder {
        async fn on_transition(&self, record: &PhaseRecord, deferred: bool) {
            self.0.lock().push((record.name.clone(), record.state, deferred));
        }
    }

    fn executor() -> PhaseExecutor {
        let registry = FunctionRegistry::new();
        registry.register(Arc::new(Echo)).expect("Echo should register");
        PhaseExecutor::new(Arc::new(registry))
    }

    fn ctx() -> ExecContext {
        ExecContext::new(
            Arc::new(MockClusterClient::new()),
            Arc::new(MockPodControllerFactory::new()),
            EngineConfig::default(),
        )
    }

    fn echo(name: &str, message: &str) -> BlueprintPhase {
        BlueprintPhase {
            func: "Echo".into(),
            name: name.into(),
            args: BTreeMap::from([("message".to_string(), json!(message))]),
            ..Default::default()
        }
    }

    /// Story: The second phase reads the first phase's output through a
    /// template, and the action publishes it as an artifact.
    #[tokio::test]
    async fn story_outputs_flow_to_later_phases_and_artifacts() {
        let action = BlueprintAction {
            phases: vec![
                echo("first", "s3://bucket/dump"),
                echo("second", "copy of {{ .Phases.first.Output.message }}"),
            ],
            output_artifacts: BTreeMap::from([(
                "backup".to_string(),
                Artifact::from_pairs([("path", "{{ .Phases.second.Output.message }}")]),
            )]),
            ..Default::default()
        };
        let recorder = Recorder::default();
        let run = executor()
            .execute(&ctx(), "backup", &action, TemplateParams::default(), &recorder)
            .await;

        assert!(run.error.is_none(), "unexpected error: {:?}", run.error);
        assert_eq!(run.state(), State::Complete);
        assert_eq!(run.phases[1].output["message"], "copy of s3://bucket/dump");
        assert_eq!(
            run.artifacts["backup"].key_value["path"],
            "copy of s3://bucket/dump"
        );
        assert_eq!(
            *recorder.0.lock(),
            vec![
                ("first".to_string(), State::Running, false),
                ("first".to_string(), State::Complete, false),
                ("second".to_string(), State::Running, false),
                ("second".to_string(), State::Complete, false),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_function_fails_before_anything_runs() {
        let mut missing = echo("second", "x");
        missing.func = "Nope".into();
        let action = BlueprintAction {
            phases: vec![echo("first", "x"), missing],
            ..Default::default()
        };
        let recorder = Recorder::default();
        let run = executor()
            .execute(&ctx(), "backup", &action, TemplateParams::default(), &recorder)
            .await;

        let err = run.error.as_ref().expect("action should fail");
        assert!(matches!(err.root(), Error::FunctionNotFound { name } if name == "Nope"));
        assert_eq!(err.phase_name(), Some("second"));
        assert!(recorder.0.lock().is_empty());
        assert!(run.phases.iter().all(|p| p.state == State::Pending));
    }

    /// Story: An undefined template reference fails the phase and the
    /// defer phase still runs to clean up.
    #[tokio::test]
    async fn story_defer_phase_runs_after_failure() {
        let action = BlueprintAction {
            phases: vec![
                echo("first", "{{ .Phases.missing.Output.x }}"),
                echo("never", "x"),
            ],
            defer_phase: Some(echo("cleanup", "done")),
            ..Default::default()
        };
        let run = executor()
            .execute(&ctx(), "backup", &action, TemplateParams::default(), &NoopObserver)
            .await;

        assert_eq!(run.state(), State::Failed);
        let err = run.error.as_ref().expect("action should fail");
        assert_eq!(err.phase_name(), Some("first"));
        assert!(matches!(err.root(), Error::Template(_)));
        assert_eq!(run.phases[1].state, State::Pending);

        let cleanup = run.deferred.as_ref().expect("defer phase should be recorded");
        assert_eq!(cleanup.state, State::Complete);
        assert_eq!(
            run.params.defer_phase.as_ref().map(|d| d.output["message"].clone()),
            Some(json!("done"))
        );
        assert_eq!(run.failed_phase().map(|p| p.name.as_str()), Some("first"));
        assert!(run.artifacts.is_empty());
    }

    /// Story: A backup phase fails and its cleanup fails too; the action
    /// reports the backup failure, which is the one that explains the run.
    #[tokio::test]
    async fn story_first_failure_wins_over_defer_failure() {
        let mut cleanup = echo("cleanup", "done");
        cleanup.args.insert("extra".into(), json!(1));
        let action = BlueprintAction {
            phases: vec![echo("first", "{{ .Phases.missing.Output.x }}")],
            defer_phase: Some(cleanup),
            ..Default::default()
        };
        let run = executor()
            .execute(&ctx(), "backup", &action, TemplateParams::default(), &NoopObserver)
            .await;

        assert_eq!(run.state(), State::Failed);
        let err = run.error.as_ref().expect("action should fail");
        assert_eq!(err.phase_name(), Some("first"));
        assert!(matches!(err.root(), Error::Template(_)));
        let deferred = run.deferred.as_ref().expect("defer phase should be recorded");
        assert_eq!(deferred.state, State::Failed);
    }

    #[tokio::test]
    async fn defer_failure_alone_fails_the_action() {
        let mut cleanup = echo("cleanup", "done");
        cleanup.args.insert("extra".into(), json!(1));
        let action = BlueprintAction {
            phases: vec![echo("first", "x")],
            defer_phase: Some(cleanup),
            ..Default::default()
        };
        let run = executor()
            .execute(&ctx(), "backup", &action, TemplateParams::default(), &NoopObserver)
            .await;

        assert_eq!(run.phases[0].state, State::Complete);
        let err = run.error.as_ref().expect("action should fail");
        assert_eq!(err.phase_name(), Some("cleanup"));
        assert!(matches!(err.root(), Error::Argument { key, .. } if key == "extra"));
    }

    #[tokio::test]
    async fn unknown_arguments_fail_validation() {
        let mut phase = echo("first", "x");
        phase.args.insert("extra".into(), json!(1));
        let action = BlueprintAction {
            phases: vec![phase],
            ..Default::default()
        };
        let run = executor()
            .execute(&ctx(), "backup", &action, TemplateParams::default(), &NoopObserver)
            .await;
        let err = run.error.expect("action should fail");
        assert!(matches!(err.root(), Error::Argument { key, .. } if key == "extra"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_exec() {
        let ctx = ctx();
        ctx.cancel_token().cancel();
        let action = BlueprintAction {
            phases: vec![echo("first", "x")],
            ..Default::default()
        };
        let run = executor()
            .execute(&ctx, "backup", &action, TemplateParams::default(), &NoopObserver)
            .await;
        let err = run.error.expect("action should fail");
        assert!(matches!(err.root(), Error::Cancelled { .. }));
    }
}
