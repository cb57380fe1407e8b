//! Pod specifications for engine-created pods

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Map, Value};

use crate::{Error, Result};

/// generateName prefix of every pod the engine creates
pub const JOB_POD_PREFIX: &str = "bulwark-job-";
/// Name of the single work container
pub const DEFAULT_CONTAINER_NAME: &str = "container";
/// Label marking pods created by the engine
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "bulwark";

// List fields in a pod spec whose entries are merged by name
const NAMED_LISTS: &[&str] = &[
    "containers",
    "initContainers",
    "volumes",
    "volumeMounts",
    "env",
    "ports",
];

/// A PersistentVolumeClaim mounted into the work container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PvcMount {
    /// Absolute path inside the container
    pub mount_path: String,
    /// Mount read-only
    pub read_only: bool,
}

impl PvcMount {
    /// Read-write mount at `mount_path`
    pub fn new(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            read_only: false,
        }
    }
}

/// What to run and how to run it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodOptions {
    /// Namespace to create the pod in
    pub namespace: String,
    /// Name prefix; the API server appends a random suffix
    pub generate_name: String,
    /// Container image
    pub image: String,
    /// Container command
    pub command: Vec<String>,
    /// Service account; empty leaves the namespace default
    pub service_account: String,
    /// Extra pod labels
    pub labels: BTreeMap<String, String>,
    /// Extra pod annotations
    pub annotations: BTreeMap<String, String>,
    /// Claims to mount, keyed by claim name
    pub volumes: BTreeMap<String, PvcMount>,
    /// Partial pod spec merged over the generated one
    pub pod_override: Map<String, Value>,
}

impl PodOptions {
    /// Options for a job pod running `command` in `image`
    pub fn job(
        namespace: impl Into<String>,
        image: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            generate_name: JOB_POD_PREFIX.to_string(),
            image: image.into(),
            command,
            ..Default::default()
        }
    }

    /// Build the pod object to create
    pub fn build_pod(&self) -> Result<Pod> {
        if self.image.is_empty() {
            return Err(Error::invalid_arg("image", "must not be empty"));
        }
        validate_metadata("podLabels", &self.labels, true)?;
        validate_metadata("podAnnotations", &self.annotations, false)?;

        let mut spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": DEFAULT_CONTAINER_NAME,
                "image": self.image,
                "command": self.command,
                "imagePullPolicy": "IfNotPresent",
            }],
        });
        if !self.service_account.is_empty() {
            spec["serviceAccountName"] = json!(self.service_account);
        }
        if !self.volumes.is_empty() {
            let (volumes, mounts) = self.volume_specs()?;
            spec["volumes"] = Value::Array(volumes);
            spec["containers"][0]["volumeMounts"] = Value::Array(mounts);
        }
        merge_override(&mut spec, &Value::Object(self.pod_override.clone()));

        let mut labels = self.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "generateName": self.generate_name,
                "namespace": self.namespace,
                "labels": labels,
                "annotations": self.annotations,
            },
            "spec": spec,
        });
        serde_json::from_value(pod)
            .map_err(|e| Error::invalid_arg("podOverride", format!("invalid pod spec: {e}")))
    }

    // Pod volumes and the matching container mounts, named vol-0, vol-1, ...
    fn volume_specs(&self) -> Result<(Vec<Value>, Vec<Value>)> {
        let mut paths = BTreeSet::new();
        let mut volumes = Vec::with_capacity(self.volumes.len());
        let mut mounts = Vec::with_capacity(self.volumes.len());
        for (index, (claim, mount)) in self.volumes.iter().enumerate() {
            if !mount.mount_path.starts_with('/') {
                return Err(Error::invalid_arg(
                    "volumes",
                    format!("mount path {:?} for {claim:?} is not absolute", mount.mount_path),
                ));
            }
            if !paths.insert(mount.mount_path.as_str()) {
                return Err(Error::invalid_arg(
                    "volumes",
                    format!("mount path {:?} is used twice", mount.mount_path),
                ));
            }
            let name = format!("vol-{index}");
            volumes.push(json!({
                "name": name,
                "persistentVolumeClaim": {"claimName": claim, "readOnly": mount.read_only},
            }));
            mounts.push(json!({
                "name": name,
                "mountPath": mount.mount_path,
                "readOnly": mount.read_only,
            }));
        }
        Ok((volumes, mounts))
    }
}

/// Merge `patch` into `base`
///
/// Objects merge recursively, a null removes the key, named lists such as
/// `containers` merge entry by entry on `name`, and anything else is replaced.
pub fn merge_override(base: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *base = patch.clone();
        return;
    };
    if !base.is_object() {
        *base = patch.clone();
        return;
    }
    let Some(base_map) = base.as_object_mut() else {
        return;
    };
    for (key, value) in patch_map {
        if value.is_null() {
            base_map.remove(key);
            continue;
        }
        let named = NAMED_LISTS.contains(&key.as_str());
        match (base_map.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(entries)) if named => {
                merge_named_list(existing, entries)
            }
            (Some(existing @ Value::Object(_)), Value::Object(_)) => {
                merge_override(existing, value)
            }
            _ => {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_named_list(existing: &mut Vec<Value>, entries: &[Value]) {
    for entry in entries {
        let name = entry.get("name").and_then(Value::as_str);
        let slot = name.and_then(|name| {
            existing
                .iter_mut()
                .find(|e| e.get("name").and_then(Value::as_str) == Some(name))
        });
        match slot {
            Some(slot) => merge_override(slot, entry),
            None => existing.push(entry.clone()),
        }
    }
}

/// Merge two override maps, `top` winning
pub fn combine_overrides(
    base: &Map<String, Value>,
    top: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = Value::Object(base.clone());
    merge_override(&mut merged, &Value::Object(top.clone()));
    match merged {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn validate_metadata(
    arg: &str,
    entries: &BTreeMap<String, String>,
    check_values: bool,
) -> Result<()> {
    for (key, value) in entries {
        if !is_qualified_name(key) {
            return Err(Error::invalid_arg(arg, format!("invalid key {key:?}")));
        }
        if check_values && !is_label_value(value) {
            return Err(Error::invalid_arg(arg, format!("invalid value {value:?} for {key:?}")));
        }
    }
    Ok(())
}

// [prefix/]name where prefix is a DNS subdomain and name is a 63-char label
fn is_qualified_name(key: &str) -> bool {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix.split('.').all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !part.starts_with('-')
                    && !part.ends_with('-')
            });
        if !valid_prefix {
            return false;
        }
    }
    !name.is_empty() && is_label_value(name)
}

fn is_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PodOptions {
        PodOptions::job("shop", "busybox", vec!["echo".into(), "hi".into()])
    }

    #[test]
    fn job_pod_has_defaults() {
        let pod = job().build_pod().expect("pod should build");
        let meta = &pod.metadata;
        assert_eq!(meta.generate_name.as_deref(), Some(JOB_POD_PREFIX));
        assert_eq!(meta.namespace.as_deref(), Some("shop"));
        assert_eq!(
            meta.labels.as_ref().and_then(|l| l.get(MANAGED_BY_LABEL)).map(String::as_str),
            Some("bulwark")
        );

        let spec = pod.spec.expect("pod should have a spec");
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].name, DEFAULT_CONTAINER_NAME);
        assert_eq!(spec.containers[0].image.as_deref(), Some("busybox"));
        assert_eq!(
            spec.containers[0].command.as_deref(),
            Some(&["echo".to_string(), "hi".to_string()][..])
        );
    }

    /// Story: A blueprint overrides the container's resources and adds a
    /// node selector; the generated container keeps its image and command.
    #[test]
    fn story_override_merges_containers_by_name() {
        let mut options = job();
        options.pod_override = json!({
            "nodeSelector": {"disk": "ssd"},
            "containers": [{
                "name": "container",
                "resources": {"limits": {"memory": "256Mi"}},
            }],
        })
        .as_object()
        .cloned()
        .expect("literal is an object");

        let spec = options.build_pod().expect("pod should build").spec.expect("spec");
        assert_eq!(
            spec.node_selector.and_then(|n| n.get("disk").cloned()).as_deref(),
            Some("ssd")
        );
        assert_eq!(spec.containers.len(), 1);
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("busybox"));
        assert!(container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .is_some_and(|l| l.contains_key("memory")));
    }

    #[test]
    fn later_override_wins_and_null_removes() {
        let base = json!({"restartPolicy": "Never", "hostNetwork": true})
            .as_object()
            .cloned()
            .expect("object");
        let top = json!({"restartPolicy": "OnFailure", "hostNetwork": null})
            .as_object()
            .cloned()
            .expect("object");
        let merged = combine_overrides(&base, &top);
        assert_eq!(merged["restartPolicy"], "OnFailure");
        assert!(!merged.contains_key("hostNetwork"));
    }

    #[test]
    fn invalid_labels_are_rejected() {
        let mut options = job();
        options.labels.insert("bad key!".into(), "v".into());
        let err = options.build_pod().expect_err("bad label key should fail");
        assert!(err.to_string().contains("podLabels"));

        let mut options = job();
        options.labels.insert("example.com/team".into(), "-dash".into());
        assert!(options.build_pod().is_err());

        let mut options = job();
        options.annotations.insert("example.com/note".into(), "any text, even spaces".into());
        assert!(options.build_pod().is_ok());
    }

    /// Story: A restore pod mounts the database claim read-write and a
    /// shared seed claim read-only.
    #[test]
    fn story_claims_are_mounted_into_the_container() {
        let mut options = job();
        options.volumes.insert("data-db-0".into(), PvcMount::new("/mnt/data"));
        options.volumes.insert(
            "seed".into(),
            PvcMount {
                mount_path: "/mnt/seed".into(),
                read_only: true,
            },
        );

        let spec = options.build_pod().expect("pod should build").spec.expect("spec");
        let volumes = spec.volumes.expect("pod should have volumes");
        assert_eq!(volumes.len(), 2);
        let claim = volumes[1]
            .persistent_volume_claim
            .as_ref()
            .expect("volume should be a claim");
        assert_eq!(claim.claim_name, "seed");
        assert_eq!(claim.read_only, Some(true));

        let mounts = spec.containers[0]
            .volume_mounts
            .as_ref()
            .expect("container should mount the claims");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, volumes[0].name);
        assert_eq!(mounts[0].mount_path, "/mnt/data");
        assert_eq!(mounts[1].read_only, Some(true));
    }

    #[test]
    fn bad_mount_paths_are_rejected() {
        let mut options = job();
        options.volumes.insert("data".into(), PvcMount::new("mnt/data"));
        let err = options.build_pod().expect_err("relative path should fail");
        assert!(err.to_string().contains("volumes"));

        let mut options = job();
        options.volumes.insert("a".into(), PvcMount::new("/mnt/x"));
        options.volumes.insert("b".into(), PvcMount::new("/mnt/x"));
        assert!(options.build_pod().is_err());
    }

    #[test]
    fn empty_image_is_rejected() {
        let options = PodOptions::job("shop", "", vec![]);
        assert!(options.build_pod().is_err());
    }
}
