//! Profile CRD types
//!
//! A `Profile` bundles a storage location with the credential needed to
//! reach it. Backup and restore functions receive the resolved form through
//! `.Profile` in their template context.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectReference;
use crate::Error;

// =============================================================================
// Location
// =============================================================================

/// Storage location type
///
/// Unrecognized strings deserialize into `Unsupported` so validation can
/// report them instead of failing to parse the whole Profile.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum LocationType {
    /// S3 or any S3-compatible object store
    S3Compliant,
    /// Google Cloud Storage
    Gcs,
    /// Azure Blob Storage
    Azure,
    /// Kopia repository server
    Kopia,
    /// Anything else
    Unsupported(String),
}

impl Default for LocationType {
    fn default() -> Self {
        Self::Unsupported(String::new())
    }
}

impl JsonSchema for LocationType {
    fn schema_name() -> String {
        "LocationType".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

impl From<String> for LocationType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "s3Compliant" => Self::S3Compliant,
            "gcs" => Self::Gcs,
            "azure" => Self::Azure,
            "kopia" => Self::Kopia,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<LocationType> for String {
    fn from(t: LocationType) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for LocationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S3Compliant => write!(f, "s3Compliant"),
            Self::Gcs => write!(f, "gcs"),
            Self::Azure => write!(f, "azure"),
            Self::Kopia => write!(f, "kopia"),
            Self::Unsupported(s) => write!(f, "{}", s),
        }
    }
}

/// Where backups are stored
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Location type
    #[serde(rename = "type", default)]
    pub location_type: LocationType,

    /// Bucket or container name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,

    /// Custom endpoint for S3-compatible stores
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Key prefix within the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,

    /// Bucket region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

// =============================================================================
// Credential
// =============================================================================

/// Credential type
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum CredentialType {
    /// Access key id and secret read from two fields of one Secret
    KeyPair,
    /// A whole Secret handed to the function
    Secret,
    /// Kopia repository server user credentials
    Kopia,
    /// Anything else
    Unsupported(String),
}

impl Default for CredentialType {
    fn default() -> Self {
        Self::Unsupported(String::new())
    }
}

impl JsonSchema for CredentialType {
    fn schema_name() -> String {
        "CredentialType".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

impl From<String> for CredentialType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "keyPair" => Self::KeyPair,
            "secret" => Self::Secret,
            "kopia" => Self::Kopia,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<CredentialType> for String {
    fn from(t: CredentialType) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyPair => write!(f, "keyPair"),
            Self::Secret => write!(f, "secret"),
            Self::Kopia => write!(f, "kopia"),
            Self::Unsupported(s) => write!(f, "{}", s),
        }
    }
}

/// Secret fields holding an access key pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// Field of the secret holding the access key id
    #[serde(default)]
    pub id_field: String,

    /// Field of the secret holding the secret access key
    #[serde(default)]
    pub secret_field: String,

    /// The secret itself
    #[serde(default)]
    pub secret: ObjectReference,
}

/// A single key within a referenced secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Key within the secret
    #[serde(default)]
    pub key: String,

    /// The secret itself
    #[serde(default)]
    pub secret: ObjectReference,
}

/// Kopia repository server credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KopiaServerSecret {
    /// Repository server user
    #[serde(default)]
    pub username: String,

    /// Hostname the user connects as
    #[serde(default)]
    pub hostname: String,

    /// Password for the repository server user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_passphrase: Option<SecretKeyRef>,

    /// TLS certificate of the repository server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<SecretKeyRef>,
}

/// Credential used to reach the location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Credential type
    #[serde(rename = "type", default)]
    pub credential_type: CredentialType,

    /// Key pair, for `keyPair` credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<KeyPair>,

    /// Whole secret, for `secret` credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ObjectReference>,

    /// Kopia server user, for `kopia` credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kopia_server_secret: Option<KopiaServerSecret>,
}

// =============================================================================
// CRD
// =============================================================================

/// Storage location plus credentials used by backup and restore functions
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cr.bulwark.dev",
    version = "v1alpha1",
    kind = "Profile",
    plural = "profiles",
    shortname = "prof",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Storage location
    pub location: Location,

    /// Credential for the location
    pub credential: Credential,

    /// Skip TLS verification when talking to the location
    #[serde(default, rename = "skipSSLVerify")]
    pub skip_ssl_verify: bool,
}

// =============================================================================
// Validation
// =============================================================================

/// Reject unsupported location types and incomplete credentials
///
/// Pure: performs no cluster lookups.
pub fn validate_profile(profile: &ProfileSpec) -> Result<(), Error> {
    validate_profile_named("profile", profile)
}

impl Profile {
    /// Validate this profile, naming it in any error
    pub fn validate(&self) -> Result<(), Error> {
        let resource = format!("profile/{}", self.metadata.name.as_deref().unwrap_or(""));
        validate_profile_named(&resource, &self.spec)
    }
}

fn validate_profile_named(resource: &str, profile: &ProfileSpec) -> Result<(), Error> {
    if let LocationType::Unsupported(t) = &profile.location.location_type {
        return Err(Error::validation_for_field(
            resource,
            "location.type",
            format!("unknown or unsupported location type '{}'", t),
        ));
    }
    validate_credential(resource, &profile.credential)?;

    let location = &profile.location;
    if location.location_type == LocationType::S3Compliant
        && !location.bucket.is_empty()
        && location.endpoint.is_empty()
        && location.region.is_empty()
    {
        return Err(Error::validation_for_field(
            resource,
            "location.region",
            "bucket region not specified",
        ));
    }
    Ok(())
}

fn validate_credential(resource: &str, credential: &Credential) -> Result<(), Error> {
    match &credential.credential_type {
        CredentialType::KeyPair => {
            let key_pair = credential.key_pair.as_ref().ok_or_else(|| {
                Error::validation_for_field(
                    resource,
                    "credential.keyPair",
                    "key pair not specified",
                )
            })?;
            if key_pair.secret.name.is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.keyPair.secret",
                    "secret for bucket credentials not specified",
                ));
            }
            if key_pair.secret_field.is_empty() || key_pair.id_field.is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.keyPair",
                    "secret field or id field empty",
                ));
            }
            Ok(())
        }
        CredentialType::Secret => {
            let secret = credential.secret.as_ref().ok_or_else(|| {
                Error::validation_for_field(resource, "credential.secret", "secret not specified")
            })?;
            if secret.name.is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.secret.name",
                    "secret name is empty",
                ));
            }
            if secret.namespace.is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.secret.namespace",
                    "secret namespace is empty",
                ));
            }
            Ok(())
        }
        CredentialType::Kopia => {
            let kopia = credential.kopia_server_secret.as_ref().ok_or_else(|| {
                Error::validation_for_field(
                    resource,
                    "credential.kopiaServerSecret",
                    "kopia server secret not specified",
                )
            })?;
            if kopia.username.is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.kopiaServerSecret.username",
                    "kopia username is empty",
                ));
            }
            if kopia.hostname.is_empty() {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.kopiaServerSecret.hostname",
                    "kopia hostname is empty",
                ));
            }
            let has_ref = |r: &Option<SecretKeyRef>| {
                r.as_ref().is_some_and(|r| !r.secret.name.is_empty())
            };
            if !has_ref(&kopia.user_passphrase) {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.kopiaServerSecret.userPassphrase",
                    "kopia user passphrase secret not specified",
                ));
            }
            if !has_ref(&kopia.tls_cert) {
                return Err(Error::validation_for_field(
                    resource,
                    "credential.kopiaServerSecret.tlsCert",
                    "kopia TLS certificate secret not specified",
                ));
            }
            Ok(())
        }
        CredentialType::Unsupported(t) => Err(Error::validation_for_field(
            resource,
            "credential.type",
            format!("unsupported credential type '{}'", t),
        )),
    }
}
