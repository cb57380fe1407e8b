//! Operator-specific error types

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] bulwark_common::Error),

    #[error("{0}")]
    Engine(#[from] bulwark_engine::Error),

    #[error("missing namespace on ActionSet")]
    MissingNamespace,

    #[error("blueprint {namespace}/{name} not found")]
    BlueprintNotFound { namespace: String, name: String },

    #[error("action '{action}' not found in blueprint '{blueprint}'")]
    ActionNotFound { blueprint: String, action: String },
}

impl OperatorError {
    /// The ActionSet can never succeed as written; retrying will not help
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Common(e) => !e.is_retryable(),
            Self::Engine(e) => !e.is_retryable(),
            Self::MissingNamespace
            | Self::BlueprintNotFound { .. }
            | Self::ActionNotFound { .. } => true,
            Self::Kube(_) | Self::Serialization(_) => false,
        }
    }

    /// The object being written to no longer exists
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}
