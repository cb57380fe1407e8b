use std::collections::BTreeMap;

use bulwark_common::crd::{
    validate_profile, ActionSpec, CredentialType, ObjectReference, ProfileSpec, SecretKeyRef,
    DEPLOYMENT_KIND, NAMESPACE_KIND, PVC_KIND, SECRET_KIND, STATEFULSET_KIND,
};
use bulwark_common::template::TemplateEngine;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use tracing::{debug, instrument};

use super::{
    render_artifacts, ArtifactParams, ConfigMapParams, CredentialParams, KeyPairParams,
    KopiaServerParams, LocationParams, NamespaceParams, ProfileParams, PvcParams, SecretParams,
    TemplateParams, WorkloadParams,
};
use crate::cluster::{ClusterClient, WorkloadKind};
use crate::{Error, Result};

impl TemplateParams {
    /// Build the template context for one ActionSet action
    ///
    /// Resolves the target object, referenced ConfigMaps and Secrets, and the
    /// Profile with its credential material, then renders the input artifacts
    /// against the result.
    #[instrument(
        skip(cluster, action),
        fields(action = %action.name, object = %action.object.display_name())
    )]
    pub async fn resolve(
        cluster: &dyn ClusterClient,
        action: &ActionSpec,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut params = TemplateParams {
            time: now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            options: action.options.clone(),
            pod_override: action.pod_override.clone(),
            pod_annotations: action.pod_annotations.clone(),
            pod_labels: action.pod_labels.clone(),
            ..Default::default()
        };

        for (key, obj) in &action.config_maps {
            let cm = cluster.get_config_map(&obj.namespace, &obj.name).await?;
            params.config_maps.insert(key.clone(), config_map_params(&cm));
        }
        for (key, obj) in &action.secrets {
            let secret = cluster.get_secret(&obj.namespace, &obj.name).await?;
            params.secrets.insert(key.clone(), secret_params(&secret));
        }
        if let Some(profile_ref) = &action.profile {
            params.profile = Some(resolve_profile(cluster, profile_ref, &action.object).await?);
        }

        let object = &action.object;
        let fetch = match object.normalized_kind().as_str() {
            STATEFULSET_KIND => {
                let kind = WorkloadKind::StatefulSet;
                params.stateful_set =
                    Some(workload_params(cluster, kind, &object.namespace, &object.name).await?);
                core_ref("apps/v1", "statefulsets", &object.namespace, &object.name)
            }
            DEPLOYMENT_KIND => {
                let kind = WorkloadKind::Deployment;
                params.deployment =
                    Some(workload_params(cluster, kind, &object.namespace, &object.name).await?);
                core_ref("apps/v1", "deployments", &object.namespace, &object.name)
            }
            PVC_KIND => {
                params.pvc = Some(PvcParams {
                    name: object.name.clone(),
                    namespace: object.namespace.clone(),
                });
                core_ref("v1", "persistentvolumeclaims", &object.namespace, &object.name)
            }
            NAMESPACE_KIND => {
                let name = if object.namespace.is_empty() {
                    object.name.clone()
                } else {
                    object.namespace.clone()
                };
                params.namespace = Some(NamespaceParams { name: name.clone() });
                core_ref("v1", "namespaces", "", &name)
            }
            _ => object.clone(),
        };
        params.object = Some(cluster.get_object(&fetch).await.map_err(|e| {
            Error::execution(
                format!("fetch {}", fetch.display_name()),
                e.to_string(),
            )
        })?);

        let artifacts_in = render_artifacts(&TemplateEngine::strict(), &action.artifacts, &params)?;
        params.artifacts_in = artifacts_in
            .into_iter()
            .map(|(name, artifact)| {
                (
                    name,
                    ArtifactParams {
                        key_value: artifact.key_value,
                    },
                )
            })
            .collect();

        debug!("template parameters resolved");
        Ok(params)
    }

    /// Fetch the secrets a phase names in its object references
    ///
    /// References of any other kind are ignored.
    pub async fn phase_secrets(
        cluster: &dyn ClusterClient,
        refs: &BTreeMap<String, ObjectReference>,
    ) -> Result<BTreeMap<String, SecretParams>> {
        let mut secrets = BTreeMap::new();
        for (key, obj) in refs {
            if obj.normalized_kind() != SECRET_KIND {
                continue;
            }
            let secret = cluster.get_secret(&obj.namespace, &obj.name).await?;
            secrets.insert(key.clone(), secret_params(&secret));
        }
        Ok(secrets)
    }
}

fn core_ref(api_version: &str, resource: &str, namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: api_version.to_string(),
        resource: resource.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

async fn workload_params(
    cluster: &dyn ClusterClient,
    kind: WorkloadKind,
    namespace: &str,
    name: &str,
) -> Result<WorkloadParams> {
    let workload = cluster.get_workload(kind, namespace, name).await?;
    let pods = cluster.list_pods(namespace, &workload.selector).await?;

    let mut params = WorkloadParams {
        name: name.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    };
    for pod in pods.iter().filter(|p| is_running(p)) {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        params.containers.push(container_names(pod));
        let claims = claim_mounts(pod);
        if !claims.is_empty() {
            params
                .persistent_volume_claims
                .insert(pod_name.clone(), claims);
        }
        params.pods.push(pod_name);
    }
    Ok(params)
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

fn container_names(pod: &Pod) -> Vec<String> {
    let from_status: Vec<String> = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();
    if !from_status.is_empty() {
        return from_status;
    }
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// claim name → mount path for every PVC-backed volume mounted in the pod
fn claim_mounts(pod: &Pod) -> BTreeMap<String, String> {
    let mut mounts = BTreeMap::new();
    let Some(spec) = pod.spec.as_ref() else {
        return mounts;
    };
    for volume in spec.volumes.iter().flatten() {
        let Some(claim) = volume.persistent_volume_claim.as_ref() else {
            continue;
        };
        let mount = spec
            .containers
            .iter()
            .flat_map(|c| c.volume_mounts.iter().flatten())
            .find(|m| m.name == volume.name);
        if let Some(mount) = mount {
            mounts.insert(claim.claim_name.clone(), mount.mount_path.clone());
        }
    }
    mounts
}

fn config_map_params(cm: &ConfigMap) -> ConfigMapParams {
    ConfigMapParams {
        name: cm.metadata.name.clone().unwrap_or_default(),
        namespace: cm.metadata.namespace.clone().unwrap_or_default(),
        data: cm.data.clone().unwrap_or_default(),
    }
}

pub(crate) fn secret_params(secret: &Secret) -> SecretParams {
    SecretParams {
        name: secret.metadata.name.clone().unwrap_or_default(),
        namespace: secret.metadata.namespace.clone().unwrap_or_default(),
        secret_type: secret.type_.clone().unwrap_or_default(),
        data: secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
            .collect(),
    }
}

async fn resolve_profile(
    cluster: &dyn ClusterClient,
    profile_ref: &ObjectReference,
    object: &ObjectReference,
) -> Result<ProfileParams> {
    let namespace = if profile_ref.namespace.is_empty() {
        &object.namespace
    } else {
        &profile_ref.namespace
    };
    let profile = cluster.get_profile(namespace, &profile_ref.name).await?;
    validate_profile(&profile.spec)?;
    let spec = &profile.spec;

    Ok(ProfileParams {
        location: LocationParams {
            location_type: spec.location.location_type.to_string(),
            bucket: spec.location.bucket.clone(),
            endpoint: spec.location.endpoint.clone(),
            prefix: spec.location.prefix.clone(),
            region: spec.location.region.clone(),
        },
        credential: resolve_credential(cluster, spec).await?,
        skip_ssl_verify: spec.skip_ssl_verify,
    })
}

async fn resolve_credential(
    cluster: &dyn ClusterClient,
    spec: &ProfileSpec,
) -> Result<CredentialParams> {
    let credential = &spec.credential;
    let mut params = CredentialParams {
        credential_type: credential.credential_type.to_string(),
        ..Default::default()
    };
    match &credential.credential_type {
        CredentialType::KeyPair => {
            let key_pair = credential
                .key_pair
                .as_ref()
                .ok_or_else(|| {
                    Error::execution("resolve profile", "keyPair credential is not set")
                })?;
            let secret = secret_params(
                &cluster
                    .get_secret(&key_pair.secret.namespace, &key_pair.secret.name)
                    .await?,
            );
            params.key_pair = Some(KeyPairParams {
                id: secret_field(&secret, &key_pair.id_field)?,
                secret: secret_field(&secret, &key_pair.secret_field)?,
            });
        }
        CredentialType::Secret => {
            let secret_ref = credential
                .secret
                .as_ref()
                .ok_or_else(|| {
                    Error::execution("resolve profile", "secret credential is not set")
                })?;
            params.secret = Some(secret_params(
                &cluster
                    .get_secret(&secret_ref.namespace, &secret_ref.name)
                    .await?,
            ));
        }
        CredentialType::Kopia => {
            let kopia = credential
                .kopia_server_secret
                .as_ref()
                .ok_or_else(|| Error::execution("resolve profile", "kopia credential is not set"))?;
            params.kopia_server_secret = Some(KopiaServerParams {
                username: kopia.username.clone(),
                hostname: kopia.hostname.clone(),
                password: secret_key(cluster, kopia.user_passphrase.as_ref()).await?,
                cert: secret_key(cluster, kopia.tls_cert.as_ref()).await?,
            });
        }
        CredentialType::Unsupported(other) => {
            return Err(Error::execution(
                "resolve profile",
                format!("credential type {other:?} is not supported"),
            ));
        }
    }
    Ok(params)
}

fn secret_field(secret: &SecretParams, field: &str) -> Result<String> {
    secret.data.get(field).cloned().ok_or_else(|| {
        Error::execution(
            format!("secret {}/{}", secret.namespace, secret.name),
            format!("key {field:?} not found"),
        )
    })
}

async fn secret_key(cluster: &dyn ClusterClient, key_ref: Option<&SecretKeyRef>) -> Result<String> {
    let Some(key_ref) = key_ref else {
        return Ok(String::new());
    };
    let secret = secret_params(
        &cluster
            .get_secret(&key_ref.secret.namespace, &key_ref.secret.name)
            .await?,
    );
    secret_field(&secret, &key_ref.key)
}
