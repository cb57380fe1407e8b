//! Weighted progress of an ActionSet

use bulwark_common::crd::{BlueprintPhase, PhaseStatus, State};

use crate::function::{PROGRESS_NOT_STARTED, PROGRESS_STARTED};

const WEIGHT_NORMAL: f64 = 1.0;
const WEIGHT_HEAVY: f64 = 2.0;

/// Functions that usually dominate an action's run time
pub const LONG_RUNNING_FUNCTIONS: &[&str] = &[
    "BackupData",
    "BackupDataAll",
    "RestoreData",
    "RestoreDataAll",
    "CopyVolumeData",
    "CreateRDSSnapshot",
    "ExportRDSSnapshotToLocation",
    "RestoreRDSSnapshot",
];

/// Weight of a phase calling `func`
pub fn phase_weight(func: &str) -> f64 {
    if LONG_RUNNING_FUNCTIONS.contains(&func) {
        WEIGHT_HEAVY
    } else {
        WEIGHT_NORMAL
    }
}

/// Percent complete across `phases`, judged by `statuses`
///
/// Statuses are matched to phases by name. Once anything is underway the
/// result is at least "10.00", so a started ActionSet never reads as idle.
pub fn action_progress(phases: &[&BlueprintPhase], statuses: &[&PhaseStatus]) -> String {
    let total: f64 = phases.iter().map(|p| phase_weight(&p.func)).sum();
    if total == 0.0 {
        return PROGRESS_STARTED.to_string();
    }
    let done: f64 = phases
        .iter()
        .filter(|p| {
            statuses
                .iter()
                .any(|s| s.name == p.name && s.state == State::Complete)
        })
        .map(|p| phase_weight(&p.func))
        .sum();

    let percent = format!("{:.2}", done / total * 100.0);
    if percent == PROGRESS_NOT_STARTED {
        PROGRESS_STARTED.to_string()
    } else {
        percent
    }
}
