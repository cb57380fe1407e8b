//! ActionSet status bookkeeping
//!
//! Pure functions that build and update an [`ActionSetStatus`] as phases
//! move through their lifecycle. The controller owns I/O; everything here
//! works on values so it can be tested without a cluster.

use bulwark_common::crd::{
    ActionSet, ActionSetStatus, ActionStatus, BlueprintAction, BlueprintPhase, PhaseStatus,
    ProgressStatus, State,
};
use bulwark_engine::function::{PROGRESS_COMPLETED, PROGRESS_NOT_STARTED};
use bulwark_engine::progress::action_progress;
use bulwark_engine::{ActionRun, PhaseProgress, PhaseRecord};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

fn pending(phase: &BlueprintPhase) -> PhaseStatus {
    PhaseStatus {
        name: phase.name.clone(),
        state: State::Pending,
        ..Default::default()
    }
}

fn progress_at(percent: &str, at: DateTime<Utc>) -> ProgressStatus {
    ProgressStatus {
        percent_completed: percent.to_string(),
        last_transition_time: Some(Time(at)),
    }
}

fn phase_progress(progress: &PhaseProgress) -> ProgressStatus {
    progress_at(&progress.percent, progress.last_transition_time)
}

/// Status for a freshly validated ActionSet: every phase pending
///
/// `blueprints` is index-aligned with `spec.actions`.
pub fn initial_status(
    actionset: &ActionSet,
    blueprints: &[BlueprintAction],
    now: DateTime<Utc>,
) -> ActionSetStatus {
    let actions = actionset
        .spec
        .actions
        .iter()
        .zip(blueprints)
        .map(|(spec, blueprint)| ActionStatus {
            name: spec.name.clone(),
            object: spec.object.clone(),
            blueprint: spec.blueprint.clone(),
            phases: blueprint.phases.iter().map(pending).collect(),
            deferred_phase: blueprint.defer_phase.as_ref().map(pending),
            artifacts: Default::default(),
        })
        .collect();

    ActionSetStatus {
        state: State::Pending,
        actions,
        progress: Some(progress_at(PROGRESS_NOT_STARTED, now)),
        error: None,
    }
}

/// Status for an ActionSet that failed before any phase could run
pub fn failed_status(
    current: Option<&ActionSetStatus>,
    message: impl Into<String>,
) -> ActionSetStatus {
    let mut status = current.cloned().unwrap_or_default();
    status.state = State::Failed;
    status.error = Some(message.into());
    status
}

/// Mirror one phase transition into the status of action `index`
///
/// Returns false when no such action or phase exists.
pub fn record_phase(
    status: &mut ActionSetStatus,
    index: usize,
    record: &PhaseRecord,
    deferred: bool,
) -> bool {
    let Some(action) = status.actions.get_mut(index) else {
        return false;
    };
    let target = if deferred {
        action.deferred_phase.as_mut()
    } else {
        action.phases.iter_mut().find(|p| p.name == record.name)
    };
    let Some(phase) = target else {
        return false;
    };

    phase.state = record.state;
    phase.output = record.output.clone();
    if let Some(progress) = &record.progress {
        phase.progress = Some(phase_progress(progress));
    }
    true
}

/// Recompute overall progress from every action's phases
///
/// The transition time only moves when the percentage changes. Returns
/// whether it did.
pub fn refresh_progress(
    status: &mut ActionSetStatus,
    blueprints: &[BlueprintAction],
    now: DateTime<Utc>,
) -> bool {
    if status.actions.is_empty() {
        return false;
    }
    let total: f64 = status
        .actions
        .iter()
        .zip(blueprints)
        .map(|(action, blueprint)| {
            let phases: Vec<&BlueprintPhase> = blueprint.phases.iter().collect();
            let statuses: Vec<&PhaseStatus> = action.phases.iter().collect();
            action_progress(&phases, &statuses)
                .parse::<f64>()
                .unwrap_or_default()
        })
        .sum();
    let percent = format!("{:.2}", total / status.actions.len() as f64);

    let unchanged = status
        .progress
        .as_ref()
        .is_some_and(|p| p.percent_completed == percent);
    if unchanged {
        return false;
    }
    status.progress = Some(progress_at(&percent, now));
    true
}

/// Copy the final outcome of action `index` into status
pub fn finish_action(status: &mut ActionSetStatus, index: usize, run: &ActionRun) {
    for record in &run.phases {
        record_phase(status, index, record, false);
    }
    if let Some(record) = &run.deferred {
        record_phase(status, index, record, true);
    }
    if let Some(action) = status.actions.get_mut(index) {
        action.artifacts = run.artifacts.clone();
    }
}

/// Settle the ActionSet as complete, or failed with `error`
pub fn finish(status: &mut ActionSetStatus, error: Option<String>, now: DateTime<Utc>) {
    match error {
        None => {
            status.state = State::Complete;
            status.error = None;
            status.progress = Some(progress_at(PROGRESS_COMPLETED, now));
        }
        Some(message) => {
            status.state = State::Failed;
            status.error = Some(message);
        }
    }
}

/// Complete and Failed ActionSets are never run again
pub fn is_terminal(status: Option<&ActionSetStatus>) -> bool {
    status.is_some_and(|s| matches!(s.state, State::Complete | State::Failed))
}

/// A Running ActionSet is orphaned only when the freshest read still shows it
/// running and no task in this process owns it
pub fn is_orphaned(latest: Option<&ActionSetStatus>, in_flight: bool) -> bool {
    !in_flight && latest.is_some_and(|s| s.state == State::Running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_common::crd::{ActionSetSpec, ActionSpec, Artifact, ObjectReference};
    use bulwark_engine::{Output, TemplateParams};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn phase(name: &str, func: &str) -> BlueprintPhase {
        BlueprintPhase {
            name: name.into(),
            func: func.into(),
            ..Default::default()
        }
    }

    fn backup_action() -> BlueprintAction {
        BlueprintAction {
            phases: vec![phase("dump", "KubeTask"), phase("upload", "BackupData")],
            defer_phase: Some(phase("cleanup", "KubeTask")),
            ..Default::default()
        }
    }

    fn actionset() -> ActionSet {
        ActionSet::new(
            "backup-db",
            ActionSetSpec {
                actions: vec![ActionSpec {
                    name: "backup".into(),
                    blueprint: "postgres-bp".into(),
                    object: ObjectReference {
                        kind: "StatefulSet".into(),
                        name: "db".into(),
                        namespace: "shop".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
            },
        )
    }

    fn record(name: &str, state: State, output: Output) -> PhaseRecord {
        PhaseRecord {
            name: name.into(),
            function: "KubeTask".into(),
            state,
            output,
            progress: None,
            error: None,
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Story: A new ActionSet gets one status entry per action, every phase
    /// pending, the defer phase listed separately, and progress at zero.
    #[test]
    fn story_initial_status_lists_every_phase_pending() {
        let status = initial_status(&actionset(), &[backup_action()], at(0));

        assert_eq!(status.state, State::Pending);
        assert_eq!(status.actions.len(), 1);
        let action = &status.actions[0];
        assert_eq!(action.name, "backup");
        assert_eq!(action.blueprint, "postgres-bp");
        assert_eq!(action.object.name, "db");
        assert_eq!(
            action.phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["dump", "upload"]
        );
        assert!(action.phases.iter().all(|p| p.state == State::Pending));
        assert_eq!(
            action.deferred_phase.as_ref().map(|p| p.name.as_str()),
            Some("cleanup")
        );
        assert_eq!(
            status.progress.as_ref().map(|p| p.percent_completed.as_str()),
            Some("0.00")
        );
    }

    #[test]
    fn initialized_status_passes_validation() {
        let mut set = actionset();
        set.status = Some(initial_status(&set, &[backup_action()], at(0)));
        set.validate().expect("initial status should be consistent");
    }

    #[test]
    fn failed_status_keeps_existing_actions() {
        let set = actionset();
        let initial = initial_status(&set, &[backup_action()], at(0));
        let failed = failed_status(Some(&initial), "blueprint postgres-bp not found");
        assert_eq!(failed.state, State::Failed);
        assert_eq!(failed.error.as_deref(), Some("blueprint postgres-bp not found"));
        assert_eq!(failed.actions.len(), 1);

        let bare = failed_status(None, "invalid");
        assert!(bare.actions.is_empty());
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Story: The dump phase completes with an output; status shows the
    /// output and the state, and the upload phase is untouched.
    #[test]
    fn story_phase_transition_is_mirrored() {
        let mut status = initial_status(&actionset(), &[backup_action()], at(0));
        let output: Output = BTreeMap::from([("path".to_string(), json!("/backups/1"))]);

        assert!(record_phase(&mut status, 0, &record("dump", State::Complete, output), false));

        let phases = &status.actions[0].phases;
        assert_eq!(phases[0].state, State::Complete);
        assert_eq!(phases[0].output["path"], "/backups/1");
        assert_eq!(phases[1].state, State::Pending);
    }

    #[test]
    fn defer_transition_updates_the_deferred_phase() {
        let mut status = initial_status(&actionset(), &[backup_action()], at(0));
        let mut cleanup = record("cleanup", State::Running, Output::new());
        cleanup.progress = Some(PhaseProgress {
            percent: "10.00".into(),
            last_transition_time: at(5),
        });

        assert!(record_phase(&mut status, 0, &cleanup, true));

        let deferred = status.actions[0]
            .deferred_phase
            .as_ref()
            .expect("defer phase should be present");
        assert_eq!(deferred.state, State::Running);
        let progress = deferred.progress.as_ref().expect("progress should be set");
        assert_eq!(progress.percent_completed, "10.00");
        assert_eq!(progress.last_transition_time, Some(Time(at(5))));
    }

    #[test]
    fn unknown_phase_or_action_is_ignored() {
        let mut status = initial_status(&actionset(), &[backup_action()], at(0));
        let before = status.clone();
        let stray = record("nope", State::Running, Output::new());
        assert!(!record_phase(&mut status, 0, &stray, false));
        let out_of_range = record("dump", State::Running, Output::new());
        assert!(!record_phase(&mut status, 3, &out_of_range, false));
        assert_eq!(status, before);
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Story: The cheap dump phase finishes before the heavy upload, so
    /// progress reads one third, and the timestamp only moves on change.
    #[test]
    fn story_progress_is_weighted_and_stamped_on_change() {
        let blueprints = [backup_action()];
        let mut status = initial_status(&actionset(), &blueprints, at(0));

        assert!(refresh_progress(&mut status, &blueprints, at(1)));
        assert_eq!(
            status.progress.as_ref().map(|p| p.percent_completed.as_str()),
            Some("10.00")
        );

        record_phase(&mut status, 0, &record("dump", State::Complete, Output::new()), false);
        assert!(refresh_progress(&mut status, &blueprints, at(2)));
        let progress = status.progress.clone().expect("progress should be set");
        assert_eq!(progress.percent_completed, "33.33");
        assert_eq!(progress.last_transition_time, Some(Time(at(2))));

        assert!(!refresh_progress(&mut status, &blueprints, at(3)));
        assert_eq!(
            status.progress.and_then(|p| p.last_transition_time),
            Some(Time(at(2)))
        );
    }

    // =========================================================================
    // Completion
    // =========================================================================

    #[test]
    fn finished_action_carries_artifacts_and_final_states() {
        let mut status = initial_status(&actionset(), &[backup_action()], at(0));
        let run = ActionRun {
            phases: vec![
                record("dump", State::Complete, Output::new()),
                record("upload", State::Complete, Output::new()),
            ],
            deferred: Some(record("cleanup", State::Complete, Output::new())),
            artifacts: BTreeMap::from([(
                "dump".to_string(),
                Artifact::from_pairs([("path", "/backups/1")]),
            )]),
            params: TemplateParams::default(),
            error: None,
        };

        finish_action(&mut status, 0, &run);
        finish(&mut status, None, at(9));

        assert_eq!(status.state, State::Complete);
        assert_eq!(status.actions[0].artifacts["dump"].key_value["path"], "/backups/1");
        assert!(status.actions[0].phases.iter().all(|p| p.state == State::Complete));
        assert_eq!(
            status.progress.as_ref().map(|p| p.percent_completed.as_str()),
            Some("100.00")
        );
        assert!(is_terminal(Some(&status)));
    }

    #[test]
    fn failure_keeps_progress_and_records_the_error() {
        let mut status = initial_status(&actionset(), &[backup_action()], at(0));
        finish(&mut status, Some("phase dump failed".into()), at(9));
        assert_eq!(status.state, State::Failed);
        assert_eq!(status.error.as_deref(), Some("phase dump failed"));
        assert_eq!(
            status.progress.as_ref().map(|p| p.percent_completed.as_str()),
            Some("0.00")
        );
        assert!(is_terminal(Some(&status)));
        assert!(!is_terminal(None));
    }

    // =========================================================================
    // Orphan Detection Stories
    // =========================================================================

    /// Story: a task finished and wrote Complete just before a reconcile ran
    /// against a stale cached Running copy; the fresh read wins and the
    /// finished status is left alone
    #[test]
    fn story_completed_run_is_not_orphaned_by_a_stale_snapshot() {
        let mut stale = initial_status(&actionset(), &[backup_action()], at(0));
        stale.state = State::Running;
        let mut latest = stale.clone();
        finish(&mut latest, None, at(5));

        assert!(is_orphaned(Some(&stale), false));
        assert!(!is_orphaned(Some(&latest), false));
    }

    #[test]
    fn running_with_a_live_task_or_deleted_is_not_orphaned() {
        let mut running = initial_status(&actionset(), &[backup_action()], at(0));
        running.state = State::Running;
        assert!(!is_orphaned(Some(&running), true));
        assert!(!is_orphaned(None, false));

        let mut failed = running.clone();
        finish(&mut failed, Some("phase dump failed".into()), at(3));
        assert!(!is_orphaned(Some(&failed), false));
    }
}
