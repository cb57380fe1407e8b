//! Custom Resource Definitions for Bulwark
//!
//! Blueprints describe what to run, ActionSets request a run, and Profiles
//! carry storage locations and credentials.

mod action_set;
mod blueprint;
mod profile;
mod types;

pub use action_set::{
    ActionSet, ActionSetSpec, ActionSetStatus, ActionSpec, ActionStatus, PhaseStatus,
    ProgressStatus,
};
pub use blueprint::{Blueprint, BlueprintAction, BlueprintPhase, BlueprintSpec};
pub use profile::{
    validate_profile, Credential, CredentialType, KeyPair, KopiaServerSecret, Location,
    LocationType, Profile, ProfileSpec, SecretKeyRef,
};
pub use types::{
    Artifact, ObjectReference, State, CONFIGMAP_KIND, DEPLOYMENT_KIND, KNOWN_OBJECT_KINDS,
    NAMESPACE_KIND, PVC_KIND, SECRET_KIND, STATEFULSET_KIND,
};
