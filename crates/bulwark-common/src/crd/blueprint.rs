//! Blueprint CRD types
//!
//! A `Blueprint` is a named collection of actions. Each action is an ordered
//! list of phases, each naming a registered function and its (possibly
//! templated) arguments.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Artifact, ObjectReference};

// =============================================================================
// Phase
// =============================================================================

/// A single step of a blueprint action
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintPhase {
    /// Name of the registered function to execute
    pub func: String,

    /// Phase name, used as the key under `.Phases` for later phases
    pub name: String,

    /// Objects the phase needs; secrets are resolved into `.Phases.<name>.Secrets`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub object_refs: BTreeMap<String, ObjectReference>,

    /// Untyped argument tree; string leaves may contain templates
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// Action
// =============================================================================

/// An ordered list of phases plus declared artifact bindings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintAction {
    /// Object kind this action operates on (informational)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// ConfigMap names the action expects in the ActionSet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_map_names: Vec<String>,

    /// Secret names the action expects in the ActionSet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_names: Vec<String>,

    /// Input artifact names the action expects in the ActionSet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_artifact_names: Vec<String>,

    /// Output artifacts whose values are templates over the final context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_artifacts: BTreeMap<String, Artifact>,

    /// Phases, executed strictly in order
    #[serde(default)]
    pub phases: Vec<BlueprintPhase>,

    /// Phase that always runs after `phases`, even when one of them failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_phase: Option<BlueprintPhase>,
}

// =============================================================================
// CRD
// =============================================================================

/// Declarative definition of named actions
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cr.bulwark.dev",
    version = "v1alpha1",
    kind = "Blueprint",
    plural = "blueprints",
    shortname = "bp",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSpec {
    /// Actions keyed by name (e.g. "backup", "restore")
    #[serde(default)]
    pub actions: BTreeMap<String, BlueprintAction>,
}

impl Blueprint {
    /// Look up an action by name
    pub fn action(&self, name: &str) -> Option<&BlueprintAction> {
        self.spec.actions.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A blueprint authored in YAML keeps phase order and raw templates
    #[test]
    fn story_blueprint_yaml_preserves_phase_order_and_templates() {
        let spec: BlueprintSpec = serde_json::from_value(serde_json::json!({
            "actions": {
                "backup": {
                    "phases": [
                        {"func": "ScaleWorkload", "name": "quiesce", "args": {"replicas": 0}},
                        {
                            "func": "KubeTask",
                            "name": "dump",
                            "args": {
                                "image": "busybox",
                                "command": ["sh", "-c", "echo {{ .StatefulSet.Name }}"]
                            }
                        }
                    ],
                    "outputArtifacts": {
                        "dump": {"keyValue": {"path": "{{ .Phases.dump.Output.path }}"}}
                    },
                    "deferPhase": {"func": "ScaleWorkload", "name": "resume", "args": {"replicas": 1}}
                }
            }
        }))
        .expect("blueprint spec should deserialize");

        let action = &spec.actions["backup"];
        let names: Vec<_> = action.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["quiesce", "dump"]);
        assert_eq!(
            action.phases[1].args["command"][2],
            "echo {{ .StatefulSet.Name }}"
        );
        assert_eq!(
            action.output_artifacts["dump"].key_value["path"],
            "{{ .Phases.dump.Output.path }}"
        );
        assert_eq!(
            action.defer_phase.as_ref().map(|p| p.name.as_str()),
            Some("resume")
        );
    }

    #[test]
    fn action_lookup_by_name() {
        let mut actions = BTreeMap::new();
        actions.insert("restore".to_string(), BlueprintAction::default());
        let bp = Blueprint::new("mysql", BlueprintSpec { actions });
        assert!(bp.action("restore").is_some());
        assert!(bp.action("backup").is_none());
    }
}
