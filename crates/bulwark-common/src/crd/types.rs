//! Types shared between the Blueprint, ActionSet and Profile CRDs

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Object kind for a StatefulSet target
pub const STATEFULSET_KIND: &str = "statefulset";
/// Object kind for a Deployment target
pub const DEPLOYMENT_KIND: &str = "deployment";
/// Object kind for a PersistentVolumeClaim target
pub const PVC_KIND: &str = "pvc";
/// Object kind for a Namespace target
pub const NAMESPACE_KIND: &str = "namespace";
/// Object kind for a Secret reference
pub const SECRET_KIND: &str = "secret";
/// Object kind for a ConfigMap reference
pub const CONFIGMAP_KIND: &str = "configmap";

/// Kinds that are resolved through typed lookups rather than a generic fetch
pub const KNOWN_OBJECT_KINDS: &[&str] =
    &[STATEFULSET_KIND, DEPLOYMENT_KIND, PVC_KIND, NAMESPACE_KIND];

/// Reference to a Kubernetes object
///
/// `kind` is matched case-insensitively against the known kinds. Any other
/// kind is addressed by `group`/`apiVersion`/`resource`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referent (e.g. "v1" or "apps/v1")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    /// API group of the referent; derived from `apiVersion` when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    /// Plural resource name (e.g. "deployments")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,

    /// Kind of the referent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Name of the referent
    #[serde(default)]
    pub name: String,

    /// Namespace of the referent, empty for cluster-scoped objects
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl ObjectReference {
    /// Lowercased kind, used to dispatch on known kinds
    pub fn normalized_kind(&self) -> String {
        self.kind.to_lowercase()
    }

    /// True if the kind is one resolved through typed lookups
    pub fn is_known_kind(&self) -> bool {
        KNOWN_OBJECT_KINDS.contains(&self.normalized_kind().as_str())
    }

    /// Short human-readable form: `kind namespace/name`
    pub fn display_name(&self) -> String {
        let kind = if self.kind.is_empty() {
            &self.resource
        } else {
            &self.kind
        };
        if self.namespace.is_empty() {
            format!("{} {}", kind, self.name)
        } else {
            format!("{} {}/{}", kind, self.namespace, self.name)
        }
    }
}

/// A named key/value bundle produced or consumed by an action
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Artifact contents; values may be templates in blueprint output artifacts
    #[serde(default)]
    pub key_value: BTreeMap<String, String>,
}

impl Artifact {
    /// Build an artifact from key/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key_value: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Execution state of an ActionSet, action or phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Not started
    #[default]
    Pending,
    /// In progress
    Running,
    /// Finished with an error
    Failed,
    /// Finished successfully
    Complete,
}

impl State {
    /// True for Complete and Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_match_case_insensitively() {
        let obj = ObjectReference {
            kind: "StatefulSet".to_string(),
            name: "db".to_string(),
            namespace: "app".to_string(),
            ..Default::default()
        };
        assert!(obj.is_known_kind());
        assert_eq!(obj.display_name(), "StatefulSet app/db");
    }

    #[test]
    fn generic_kind_is_not_known() {
        let obj = ObjectReference {
            api_version: "v1".to_string(),
            resource: "services".to_string(),
            name: "svc".to_string(),
            ..Default::default()
        };
        assert!(!obj.is_known_kind());
        assert_eq!(obj.display_name(), "services svc");
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&State::Complete).expect("state should serialize");
        assert_eq!(json, "\"complete\"");
        assert!(State::Failed.is_terminal());
        assert!(!State::Running.is_terminal());
    }

    #[test]
    fn object_reference_deserializes_camel_case() {
        let obj: ObjectReference = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "resource": "deployments",
            "name": "web",
            "namespace": "prod"
        }))
        .expect("object reference should deserialize");
        assert_eq!(obj.api_version, "apps/v1");
        assert_eq!(obj.group, "");
    }
}
