//! Template parameters threaded through an action
//!
//! [`TemplateParams`] is the data root every argument template renders
//! against. It serializes with PascalCase keys so blueprints address it the
//! way they always have: `.StatefulSet.Pods`, `.Profile.Location.Bucket`,
//! `.Phases.backup.Output.path`.
//!
//! Outputs only flow forward: a phase's entry under `Phases` is written when
//! the phase completes, so earlier phases never observe later outputs.

pub(crate) mod render;
mod resolve;

pub use render::{render_args, render_artifacts, render_object_refs};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::output::Output;
use crate::Result;

/// Identity and layout of a StatefulSet or Deployment target
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct WorkloadParams {
    /// Workload name
    pub name: String,
    /// Workload namespace
    pub namespace: String,
    /// Running pod names
    pub pods: Vec<String>,
    /// Container names, one list per pod in `pods` order
    pub containers: Vec<Vec<String>>,
    /// pod → claim → mount path
    pub persistent_volume_claims: BTreeMap<String, BTreeMap<String, String>>,
}

/// A PersistentVolumeClaim target
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PvcParams {
    /// Claim name
    pub name: String,
    /// Claim namespace
    pub namespace: String,
}

/// A Namespace target
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NamespaceParams {
    /// Namespace name
    pub name: String,
}

/// An artifact as seen by templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ArtifactParams {
    /// Artifact contents
    pub key_value: BTreeMap<String, String>,
}

/// A ConfigMap as seen by templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigMapParams {
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace
    pub namespace: String,
    /// ConfigMap data
    pub data: BTreeMap<String, String>,
}

/// A Secret as seen by templates; data is decoded to text
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SecretParams {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Secret type (e.g. "Opaque")
    #[serde(rename = "Type")]
    pub secret_type: String,
    /// Secret data, UTF-8 decoded
    pub data: BTreeMap<String, String>,
}

/// Resolved storage location
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LocationParams {
    /// Location type (e.g. "s3Compliant")
    #[serde(rename = "Type")]
    pub location_type: String,
    /// Bucket
    pub bucket: String,
    /// Endpoint
    pub endpoint: String,
    /// Path prefix
    pub prefix: String,
    /// Region
    pub region: String,
}

/// Key pair read out of a credential secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KeyPairParams {
    /// Access key id
    #[serde(rename = "ID")]
    pub id: String,
    /// Secret access key
    #[serde(rename = "Secret")]
    pub secret: String,
}

/// Kopia repository server credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct KopiaServerParams {
    /// Repository server user
    pub username: String,
    /// Repository server host
    pub hostname: String,
    /// User passphrase
    pub password: String,
    /// TLS certificate
    pub cert: String,
}

/// Resolved credential
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialParams {
    /// Credential type (e.g. "keyPair")
    #[serde(rename = "Type")]
    pub credential_type: String,
    /// Present for key pair credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<KeyPairParams>,
    /// Present for secret credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretParams>,
    /// Present for kopia credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kopia_server_secret: Option<KopiaServerParams>,
}

/// A resolved Profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ProfileParams {
    /// Storage location
    pub location: LocationParams,
    /// Credential material
    pub credential: CredentialParams,
    /// Skip TLS verification against the location
    #[serde(rename = "SkipSSLVerify")]
    pub skip_ssl_verify: bool,
}

/// Per-phase data visible to later phases
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PhaseParams {
    /// Secrets named in the phase's object references
    pub secrets: BTreeMap<String, SecretParams>,
    /// Output captured when the phase completed
    pub output: Output,
}

/// Data root for argument templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateParams {
    /// StatefulSet target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<WorkloadParams>,
    /// Deployment target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<WorkloadParams>,
    /// PersistentVolumeClaim target
    #[serde(rename = "PVC", skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcParams>,
    /// Namespace target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceParams>,
    /// Content of any other target kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Rendered input artifacts
    pub artifacts_in: BTreeMap<String, ArtifactParams>,
    /// Referenced ConfigMaps by ActionSet key
    pub config_maps: BTreeMap<String, ConfigMapParams>,
    /// Referenced Secrets by ActionSet key
    pub secrets: BTreeMap<String, SecretParams>,
    /// Action start time, RFC 3339 with nanoseconds
    pub time: String,
    /// Resolved Profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileParams>,
    /// Free-form options from the ActionSet
    pub options: BTreeMap<String, String>,
    /// Completed phases by name
    pub phases: BTreeMap<String, PhaseParams>,
    /// The defer phase, once it has run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defer_phase: Option<PhaseParams>,
    /// Pod spec override from the ActionSet
    pub pod_override: BTreeMap<String, Value>,
    /// Extra pod annotations from the ActionSet
    pub pod_annotations: BTreeMap<String, String>,
    /// Extra pod labels from the ActionSet
    pub pod_labels: BTreeMap<String, String>,
}

impl TemplateParams {
    /// Serialize into the JSON tree templates render against
    pub fn to_data(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// The StatefulSet or Deployment target, whichever is set
    pub fn workload(&self) -> Option<&WorkloadParams> {
        self.stateful_set.as_ref().or(self.deployment.as_ref())
    }

    /// Record the secrets a phase declared, before it runs
    ///
    /// The defer phase sees the same secrets under `.DeferPhase`.
    pub fn init_phase(&mut self, phase: &str, secrets: BTreeMap<String, SecretParams>) {
        self.defer_phase = Some(PhaseParams {
            secrets: secrets.clone(),
            output: Output::new(),
        });
        self.phases.insert(
            phase.to_string(),
            PhaseParams {
                secrets,
                output: Output::new(),
            },
        );
    }

    /// Publish a completed phase's output to later phases
    pub fn set_phase_output(&mut self, phase: &str, output: Output) {
        self.phases.entry(phase.to_string()).or_default().output = output;
    }

    /// Publish the defer phase's output
    pub fn set_defer_output(&mut self, output: Output) {
        self.defer_phase.get_or_insert_with(PhaseParams::default).output = output;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_serialize_with_template_field_names() {
        let params = TemplateParams {
            stateful_set: Some(WorkloadParams {
                name: "db".to_string(),
                namespace: "shop".to_string(),
                pods: vec!["db-0".to_string()],
                containers: vec![vec!["postgres".to_string()]],
                persistent_volume_claims: BTreeMap::from([(
                    "db-0".to_string(),
                    BTreeMap::from([("data-db-0".to_string(), "/var/lib/pg".to_string())]),
                )]),
            }),
            pvc: Some(PvcParams {
                name: "data".to_string(),
                namespace: "shop".to_string(),
            }),
            profile: Some(ProfileParams {
                credential: CredentialParams {
                    credential_type: "keyPair".to_string(),
                    key_pair: Some(KeyPairParams {
                        id: "AKIA".to_string(),
                        secret: "s3cr3t".to_string(),
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let data = params.to_data().expect("params should serialize");
        assert_eq!(data["StatefulSet"]["Pods"], json!(["db-0"]));
        assert_eq!(
            data["StatefulSet"]["PersistentVolumeClaims"]["db-0"]["data-db-0"],
            "/var/lib/pg"
        );
        assert_eq!(data["PVC"]["Name"], "data");
        assert_eq!(data["Profile"]["Credential"]["KeyPair"]["ID"], "AKIA");
        assert_eq!(data["Profile"]["Credential"]["Type"], "keyPair");
        assert!(data.get("Deployment").is_none());
        assert!(data["Profile"]["Credential"].get("Secret").is_none());
    }

    /// Story: A phase's output is visible to later phases under its name,
    /// and the defer phase keeps its own slot.
    #[test]
    fn story_phase_outputs_are_published_by_name() {
        let mut params = TemplateParams::default();
        params.init_phase("dump", BTreeMap::new());
        params.set_phase_output(
            "dump",
            Output::from_iter([("path".to_string(), json!("s3://b/dump.sql"))]),
        );
        params.set_defer_output(Output::from_iter([("cleaned".to_string(), json!(true))]));

        let data = params.to_data().expect("params should serialize");
        assert_eq!(data["Phases"]["dump"]["Output"]["path"], "s3://b/dump.sql");
        assert_eq!(data["DeferPhase"]["Output"]["cleaned"], true);
    }
}
