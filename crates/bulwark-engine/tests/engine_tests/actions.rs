//! Integration tests for running whole blueprint actions
//!
//! Each test is a backup or restore scenario a blueprint author would
//! write, run end to end through the executor and the built-in functions.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bulwark_common::crd::{Artifact, BlueprintAction, BlueprintPhase, State};
use bulwark_engine::output::phase_output_line;
use bulwark_engine::param::WorkloadParams;
use bulwark_engine::{Error, FunctionRegistry, PhaseExecutor, TemplateParams};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde_json::{json, Value};

use super::fakes::{context, FakeCluster, FakePods, Spy, Transitions};

// =============================================================================
// Test Fixtures
// =============================================================================

fn phase(name: &str, func: &str, args: Value) -> BlueprintPhase {
    BlueprintPhase {
        func: func.to_string(),
        name: name.to_string(),
        object_refs: BTreeMap::new(),
        args: args
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default(),
    }
}

fn builtins() -> FunctionRegistry {
    FunctionRegistry::with_builtins().expect("built-ins should register")
}

fn db_params() -> TemplateParams {
    TemplateParams {
        stateful_set: Some(WorkloadParams {
            name: "db".to_string(),
            namespace: "shop".to_string(),
            pods: vec!["db-0".to_string()],
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Story: Phases run in order and stop at the first failure
// =============================================================================

/// Story: The second of three phases fails. The third is never invoked,
/// the action fails naming the second phase, and the observer saw the
/// first phase complete before the second started.
#[tokio::test]
async fn story_failure_stops_later_phases() {
    let first = Spy::ok("First");
    let second = Spy::failing("Second");
    let third = Spy::ok("Third");
    let registry = FunctionRegistry::new();
    registry.register(first.clone()).expect("First should register");
    registry.register(second.clone()).expect("Second should register");
    registry.register(third.clone()).expect("Third should register");

    let action = BlueprintAction {
        phases: vec![
            phase("quiesce", "First", json!({})),
            phase("snapshot", "Second", json!({})),
            phase("resume", "Third", json!({})),
        ],
        ..Default::default()
    };
    let observer = Transitions::default();
    let ctx = context(Arc::default(), Arc::default());

    let run = PhaseExecutor::new(Arc::new(registry))
        .execute(&ctx, "backup", &action, TemplateParams::default(), &observer)
        .await;

    assert_eq!(run.state(), State::Failed);
    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
    assert_eq!(
        run.phases.iter().map(|p| p.state).collect::<Vec<_>>(),
        vec![State::Complete, State::Failed, State::Pending]
    );
    let err = run.error.as_ref().expect("action should carry its error");
    assert_eq!(err.phase_name(), Some("snapshot"));
    assert_eq!(run.failed_phase().map(|p| p.name.as_str()), Some("snapshot"));
    assert!(run.artifacts.is_empty());

    assert_eq!(observer.of("quiesce"), vec![State::Running, State::Complete]);
    assert_eq!(observer.of("snapshot"), vec![State::Running, State::Failed]);
    assert!(observer.of("resume").is_empty());
}

/// Story: A blueprint names a function nobody registered. Nothing runs,
/// not even the phases before the unknown one.
#[tokio::test]
async fn story_unknown_function_fails_before_any_phase_runs() {
    let first = Spy::ok("First");
    let registry = FunctionRegistry::new();
    registry.register(first.clone()).expect("First should register");

    let action = BlueprintAction {
        phases: vec![
            phase("quiesce", "First", json!({})),
            phase("snapshot", "CreateVolumeSnapshot", json!({})),
        ],
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(registry))
        .execute(
            &context(Arc::default(), Arc::default()),
            "backup",
            &action,
            TemplateParams::default(),
            &Transitions::default(),
        )
        .await;

    assert_eq!(first.calls(), 0);
    let err = run.error.expect("unknown function should fail the action");
    assert!(matches!(
        err.root(),
        Error::FunctionNotFound { name } if name == "CreateVolumeSnapshot"
    ));
}

/// Story: Quiescing a database is the first thing that fails; the defer
/// phase that scales it back up still runs, and the action reports the
/// original failure.
#[tokio::test]
async fn story_defer_phase_runs_after_failure() {
    let registry = builtins();
    registry.register(Spy::failing("Freeze")).expect("Freeze should register");
    let cluster = Arc::new(FakeCluster::default());
    cluster.replicas.lock().insert("db".to_string(), 0);

    let action = BlueprintAction {
        phases: vec![phase("freeze", "Freeze", json!({}))],
        defer_phase: Some(phase("thaw", "ScaleWorkload", json!({"replicas": 1}))),
        ..Default::default()
    };
    let observer = Transitions::default();
    let run = PhaseExecutor::new(Arc::new(registry))
        .execute(
            &context(cluster.clone(), Arc::default()),
            "backup",
            &action,
            db_params(),
            &observer,
        )
        .await;

    assert_eq!(run.state(), State::Failed);
    assert_eq!(run.error.as_ref().and_then(|e| e.phase_name()), Some("freeze"));
    let deferred = run.deferred.as_ref().expect("defer phase should be recorded");
    assert_eq!(deferred.state, State::Complete);
    assert_eq!(cluster.replicas.lock().get("db"), Some(&1));
    assert!(observer
        .0
        .lock()
        .iter()
        .any(|(name, state, deferred)| name == "thaw" && *state == State::Complete && *deferred));
}

// =============================================================================
// Story: Built-in functions against a fake cluster
// =============================================================================

/// Story: A backup scales the database down, then runs a task pod that
/// echoes a greeting as a phase output.
#[tokio::test]
async fn story_scale_then_task() {
    let cluster = Arc::new(FakeCluster::default());
    let pods = Arc::new(FakePods::default());
    *pods.log.lock() = format!(
        "starting\n{}\n",
        phase_output_line("greeting", "hi").expect("valid output key")
    );

    let action = BlueprintAction {
        phases: vec![
            phase("scaleDown", "ScaleWorkload", json!({"replicas": 0})),
            phase(
                "greet",
                "KubeTask",
                json!({"image": "busybox", "command": ["echo", "hi"]}),
            ),
        ],
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(builtins()))
        .execute(
            &context(cluster.clone(), pods.clone()),
            "backup",
            &action,
            db_params(),
            &Transitions::default(),
        )
        .await;

    assert!(run.error.is_none(), "action failed: {:?}", run.error);
    assert_eq!(run.phases[0].state, State::Complete);
    assert!(run.phases[0].output.is_empty());
    assert_eq!(run.phases[1].state, State::Complete);
    assert_eq!(run.phases[1].output["greeting"], "hi");
    assert_eq!(cluster.replicas.lock().get("db"), Some(&0));

    let requested = pods.requested.lock();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].namespace, "bulwark");
    assert_eq!(requested[0].service_account, "bulwark-runner");
    assert_eq!(pods.stopped.load(Ordering::SeqCst), 1);
}

/// Story: The task pod runs a bare `echo hi` with no output marker; its
/// log line still lands in the phase output.
#[tokio::test]
async fn story_scale_then_plain_echo() {
    let cluster = Arc::new(FakeCluster::default());
    let pods = Arc::new(FakePods::default());
    *pods.log.lock() = "hi\n".to_string();

    let action = BlueprintAction {
        phases: vec![
            phase("A", "ScaleWorkload", json!({"replicas": 0})),
            phase("B", "KubeTask", json!({"image": "busybox", "command": ["echo", "hi"]})),
        ],
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(builtins()))
        .execute(
            &context(cluster.clone(), pods),
            "backup",
            &action,
            db_params(),
            &Transitions::default(),
        )
        .await;

    assert!(run.error.is_none(), "action failed: {:?}", run.error);
    assert_eq!(run.phases[0].state, State::Complete);
    assert!(run.phases[0].output.is_empty());
    assert_eq!(run.phases[1].state, State::Complete);
    assert!(run.phases[1].output.contains_key("hi"));
    assert_eq!(cluster.replicas.lock().get("db"), Some(&0));
}

/// Story: A restore first seeds the database claim through a helper pod
/// that reports how many files it copied.
#[tokio::test]
async fn story_prepare_data_mounts_the_workload_claim() {
    let cluster = Arc::new(FakeCluster::default());
    cluster
        .pvcs
        .lock()
        .insert("data-db-0".to_string(), PersistentVolumeClaim::default());
    let pods = Arc::new(FakePods::default());
    *pods.log.lock() = "files 12\n".to_string();

    let mut params = db_params();
    if let Some(workload) = params.stateful_set.as_mut() {
        workload.persistent_volume_claims = BTreeMap::from([(
            "db-0".to_string(),
            BTreeMap::from([("data-db-0".to_string(), "/var/lib/pg".to_string())]),
        )]);
    }
    let action = BlueprintAction {
        phases: vec![phase(
            "seed",
            "PrepareData",
            json!({
                "namespace": "{{ .StatefulSet.Namespace }}",
                "image": "busybox",
                "command": ["sh", "-c", "echo files 12"],
            }),
        )],
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(builtins()))
        .execute(
            &context(cluster, pods.clone()),
            "restore",
            &action,
            params,
            &Transitions::default(),
        )
        .await;

    assert!(run.error.is_none(), "action failed: {:?}", run.error);
    assert_eq!(run.phases[0].output["files"], "12");
    let requested = pods.requested.lock();
    assert_eq!(requested[0].namespace, "shop");
    assert_eq!(
        requested[0].volumes["data-db-0"].mount_path,
        "/mnt/prepare_data/data-db-0"
    );
    assert_eq!(pods.stopped.load(Ordering::SeqCst), 1);
}

/// Story: A dump phase reports where it wrote the backup; a later phase
/// and the output artifact both read it back through `.Phases`.
#[tokio::test]
async fn story_outputs_flow_to_later_phases_and_artifacts() {
    let cluster = Arc::new(FakeCluster::default());
    let pods = Arc::new(FakePods::default());
    *pods.log.lock() = format!(
        "{}\n",
        phase_output_line("path", "/backups/2024-01-01").expect("valid output key")
    );

    let action = BlueprintAction {
        phases: vec![
            phase(
                "dump",
                "KubeTask",
                json!({"image": "postgres:16", "command": ["pg_dump"]}),
            ),
            phase(
                "verify",
                "KubeExec",
                json!({
                    "namespace": "{{ .StatefulSet.Namespace }}",
                    "pod": "{{ index .StatefulSet.Pods 0 }}",
                    "command": ["ls", "{{ .Phases.dump.Output.path }}"],
                }),
            ),
        ],
        output_artifacts: BTreeMap::from([(
            "dump".to_string(),
            Artifact::from_pairs([("path", "{{ .Phases.dump.Output.path }}")]),
        )]),
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(builtins()))
        .execute(
            &context(cluster.clone(), pods),
            "backup",
            &action,
            db_params(),
            &Transitions::default(),
        )
        .await;

    assert!(run.error.is_none(), "action failed: {:?}", run.error);
    let execs = cluster.execs.lock();
    assert_eq!(
        execs.as_slice(),
        [(
            "shop".to_string(),
            "db-0".to_string(),
            vec!["ls".to_string(), "/backups/2024-01-01".to_string()]
        )]
    );
    assert_eq!(run.artifacts["dump"].key_value["path"], "/backups/2024-01-01");
    assert_eq!(
        run.params.phases["dump"].output["path"],
        Value::String("/backups/2024-01-01".to_string())
    );
}

/// Story: An argument template names an option the ActionSet never set.
/// Rendering is strict, so the phase fails instead of running with an
/// empty value.
#[tokio::test]
async fn story_missing_template_value_fails_the_phase() {
    let cluster = Arc::new(FakeCluster::default());
    let action = BlueprintAction {
        phases: vec![phase(
            "verify",
            "KubeExec",
            json!({
                "namespace": "shop",
                "pod": "{{ .Options.pod }}",
                "command": ["true"],
            }),
        )],
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(builtins()))
        .execute(
            &context(cluster.clone(), Arc::default()),
            "backup",
            &action,
            TemplateParams::default(),
            &Transitions::default(),
        )
        .await;

    let err = run.error.expect("undefined option should fail");
    assert!(matches!(err.root(), Error::Template(_)));
    assert!(cluster.execs.lock().is_empty());
}

/// Story: The ActionSet is deleted before its action starts; no phase runs.
#[tokio::test]
async fn story_cancelled_action_runs_nothing() {
    let spy = Spy::ok("First");
    let registry = FunctionRegistry::new();
    registry.register(spy.clone()).expect("First should register");
    let ctx = context(Arc::default(), Arc::default());
    ctx.cancel_token().cancel();

    let action = BlueprintAction {
        phases: vec![phase("quiesce", "First", json!({}))],
        ..Default::default()
    };
    let run = PhaseExecutor::new(Arc::new(registry))
        .execute(&ctx, "backup", &action, TemplateParams::default(), &Transitions::default())
        .await;

    assert_eq!(spy.calls(), 0);
    let err = run.error.expect("cancelled action should fail");
    assert!(matches!(err.root(), Error::Cancelled { .. }));
}
