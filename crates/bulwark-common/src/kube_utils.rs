//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, `ApiResource` building for dynamically addressed
//! objects, and discovery of the controller's own namespace and service
//! account.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::crd::ObjectReference;
use crate::{Error, BULWARK_SYSTEM_NAMESPACE, DEFAULT_SERVICE_ACCOUNT};

/// Environment variable carrying the controller's namespace (downward API)
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Environment variable carrying the controller's service account
pub const POD_SERVICE_ACCOUNT_ENV: &str = "POD_SERVICE_ACCOUNT";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Namespace the controller runs in
///
/// Read from `POD_NAMESPACE`, falling back to `bulwark-system`.
pub fn controller_namespace() -> String {
    std::env::var(POD_NAMESPACE_ENV)
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| BULWARK_SYSTEM_NAMESPACE.to_string())
}

/// Service account the controller runs as
///
/// Read from `POD_SERVICE_ACCOUNT`, falling back to `default`.
pub fn controller_service_account() -> String {
    std::env::var(POD_SERVICE_ACCOUNT_ENV)
        .ok()
        .filter(|sa| !sa.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string())
}

/// Parse an apiVersion string into (group, version)
///
/// ```
/// use bulwark_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from group, version and plural resource name
///
/// The kind is left empty: dynamic GETs only need the URL path segments.
pub fn api_resource_for(group: &str, version: &str, resource: &str) -> ApiResource {
    let api_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version,
        kind: String::new(),
        plural: resource.to_string(),
    }
}

/// Build an ApiResource from an object reference
///
/// `apiVersion` may be either "group/version" or a bare version, in which
/// case `group` supplies the group. An empty resource is derived from the kind.
pub fn api_resource_for_ref(obj: &ObjectReference) -> Result<ApiResource, Error> {
    let (parsed_group, version) = parse_api_version(&obj.api_version);
    if version.is_empty() {
        return Err(Error::validation_for_field(
            obj.display_name(),
            "apiVersion",
            "object reference must specify apiVersion",
        ));
    }
    let group = if obj.group.is_empty() {
        parsed_group
    } else {
        obj.group.clone()
    };
    let resource = if obj.resource.is_empty() {
        if obj.kind.is_empty() {
            return Err(Error::validation_for_field(
                obj.display_name(),
                "resource",
                "object reference must specify resource or kind",
            ));
        }
        pluralize_kind(&obj.kind)
    } else {
        obj.resource.clone()
    };
    let mut ar = api_resource_for(&group, &version, &resource);
    ar.kind = obj.kind.clone();
    Ok(ar)
}

/// Pluralize a Kubernetes resource kind
///
/// Handles the irregular core kinds, falling back to simple English rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    match lower.as_str() {
        "endpoints" => return lower,
        "persistentvolumeclaim" | "pvc" => return "persistentvolumeclaims".to_string(),
        _ => {}
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
