//! Common types for Bulwark: CRDs, errors, templates, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Bulwark custom resources
pub const BULWARK_GROUP: &str = "cr.bulwark.dev";

/// Namespace the controller runs in when nothing else is configured
pub const BULWARK_SYSTEM_NAMESPACE: &str = "bulwark-system";

/// Service account used for function pods when nothing else is configured
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Field manager name for server-side apply and status patches
pub const FIELD_MANAGER: &str = "bulwark-controller";
