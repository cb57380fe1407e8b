//! ActionSet CRD types
//!
//! An `ActionSet` is one execution request: each action names a target
//! object, a blueprint, a profile and optional inputs. The controller mirrors
//! phase states, outputs and artifacts back into status.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Artifact, ObjectReference, State};
use crate::Error;

// =============================================================================
// Spec
// =============================================================================

/// A single requested action
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Name of the blueprint action to run
    pub name: String,

    /// Target object the action operates on
    pub object: ObjectReference,

    /// Blueprint name, looked up in the ActionSet's namespace
    #[serde(default)]
    pub blueprint: String,

    /// Input artifacts exposed as `.ArtifactsIn`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Artifact>,

    /// ConfigMaps exposed as `.ConfigMaps.<key>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_maps: BTreeMap<String, ObjectReference>,

    /// Secrets exposed as `.Secrets.<key>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, ObjectReference>,

    /// Profile carrying storage location and credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ObjectReference>,

    /// Free-form options exposed as `.Options`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,

    /// Pod spec fragment merged into every pod the action launches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_override: BTreeMap<String, serde_json::Value>,

    /// Labels added to every pod the action launches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    /// Annotations added to every pod the action launches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,
}

/// ActionSet specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cr.bulwark.dev",
    version = "v1alpha1",
    kind = "ActionSet",
    plural = "actionsets",
    shortname = "as",
    namespaced,
    status = "ActionSetStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress.percentCompleted"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ActionSetSpec {
    /// Requested actions, executed in order
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of one phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    /// Phase name
    pub name: String,

    /// Current state
    #[serde(default)]
    pub state: State,

    /// Output captured when the phase completed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<String, serde_json::Value>,

    /// Progress snapshot reported by the function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressStatus>,
}

/// Observed state of one action
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    /// Blueprint action name
    pub name: String,

    /// Target object
    pub object: ObjectReference,

    /// Blueprint name
    #[serde(default)]
    pub blueprint: String,

    /// Phase states in blueprint order
    #[serde(default)]
    pub phases: Vec<PhaseStatus>,

    /// State of the deferred phase, if the action declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_phase: Option<PhaseStatus>,

    /// Rendered output artifacts
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Artifact>,
}

/// Percent-complete snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStatus {
    /// Percent completed, formatted with two decimals (e.g. "42.50")
    #[serde(default)]
    pub percent_completed: String,

    /// When the percentage last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// ActionSet status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSetStatus {
    /// Aggregate state
    #[serde(default)]
    pub state: State,

    /// Per-action status, index-aligned with `spec.actions`
    #[serde(default)]
    pub actions: Vec<ActionStatus>,

    /// Overall progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressStatus>,

    /// Error message of the failure that stopped the ActionSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Validation
// =============================================================================

impl ActionSet {
    /// Validate spec and, when present, status consistency
    pub fn validate(&self) -> Result<(), Error> {
        let resource = format!("actionset/{}", self.metadata.name.as_deref().unwrap_or(""));
        for action in &self.spec.actions {
            validate_action_spec(&resource, action)?;
        }
        if let Some(status) = &self.status {
            if status.actions.len() != self.spec.actions.len() {
                return Err(Error::validation_for(
                    resource,
                    "number of actions in status actions and spec must match",
                ));
            }
            validate_status(&resource, status)?;
        }
        Ok(())
    }
}

fn validate_action_spec(resource: &str, action: &ActionSpec) -> Result<(), Error> {
    if action.object.is_known_kind() {
        return Ok(());
    }
    if action.object.api_version.is_empty() || action.object.resource.is_empty() {
        return Err(Error::validation_for_field(
            resource,
            "spec.actions.object",
            format!(
                "not a known object kind '{}'; action '{}' must specify resource and apiVersion",
                action.object.kind, action.name
            ),
        ));
    }
    Ok(())
}

fn validate_status(resource: &str, status: &ActionSetStatus) -> Result<(), Error> {
    let mut any_unfinished = false;
    for action in &status.actions {
        let mut previous_incomplete: Option<State> = None;
        for phase in &action.phases {
            if let Some(state) = previous_incomplete {
                if phase.state != State::Pending {
                    return Err(Error::validation_for(
                        resource,
                        format!("phases after a {} one must be pending", state),
                    ));
                }
            } else if phase.state != State::Complete {
                previous_incomplete = Some(phase.state);
            }
            any_unfinished |= matches!(phase.state, State::Pending | State::Running);
        }
    }
    if any_unfinished && status.state == State::Complete {
        return Err(Error::validation_for(
            resource,
            "actionset cannot be complete if any actions are not complete",
        ));
    }
    Ok(())
}
