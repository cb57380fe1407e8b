//! Error types for blueprint execution
//!
//! Every variant carries the names needed to diagnose a failed ActionSet
//! from its status message alone: the argument key, the function, the pod,
//! or the phase that was running.

use std::time::Duration;

use bulwark_common::template::TemplateError;
use thiserror::Error;

/// Why an argument was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentErrorKind {
    /// A required argument was not supplied
    Missing,
    /// The supplied value cannot be decoded into the expected shape
    TypeMismatch,
    /// The argument is not accepted by the function
    Unknown,
}

impl std::fmt::Display for ArgumentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::TypeMismatch => write!(f, "type mismatch"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Engine error
#[derive(Debug, Error)]
pub enum Error {
    /// A function argument is missing, unknown, or of the wrong shape
    #[error("argument {key:?} {kind}: {message}")]
    Argument {
        /// Argument name
        key: String,
        /// What is wrong with it
        kind: ArgumentErrorKind,
        /// Detail
        message: String,
    },

    /// A template failed to parse or render
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A blueprint names a function that is not registered
    #[error("function {name:?} is not registered")]
    FunctionNotFound {
        /// Requested function name
        name: String,
    },

    /// A function was registered twice under the same name
    #[error("function {name:?} is already registered")]
    DuplicateName {
        /// Conflicting function name
        name: String,
    },

    /// The function's own work failed
    #[error("{context}: {message}")]
    Execution {
        /// What was being done (e.g. "pod shop/bulwark-job-x")
        context: String,
        /// Failure detail
        message: String,
    },

    /// A pod never became ready
    #[error("pod {namespace}/{pod} did not become ready: {message}")]
    PodNotReady {
        /// Pod namespace
        namespace: String,
        /// Pod name
        pod: String,
        /// Failure detail
        message: String,
    },

    /// One or more fan-out targets failed
    #[error("{}", .errors.join("\n"))]
    Aggregate {
        /// One message per failed target
        errors: Vec<String>,
    },

    /// A wait ran out of time
    #[error(
        "timed out after {timeout:?} waiting for {what}{}",
        .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    )]
    Timeout {
        /// What was being waited for
        what: String,
        /// The deadline that expired
        timeout: Duration,
        /// The most recent evaluation error, if any
        last_error: Option<String>,
    },

    /// The enclosing context was cancelled
    #[error("cancelled while {context}")]
    Cancelled {
        /// What was in progress
        context: String,
    },

    /// A phase failed; wraps the underlying error with the phase and function
    #[error("phase {phase:?} (function {function}) failed: {source}")]
    Phase {
        /// Phase name
        phase: String,
        /// Function name
        function: String,
        /// Underlying error
        source: Box<Error>,
    },

    /// Shared Kubernetes, validation or serialization error
    #[error(transparent)]
    Common(#[from] bulwark_common::Error),
}

impl Error {
    /// A required argument was not supplied
    pub fn missing_arg(key: impl Into<String>) -> Self {
        Self::Argument {
            key: key.into(),
            kind: ArgumentErrorKind::Missing,
            message: "required argument not supplied".to_string(),
        }
    }

    /// An argument could not be decoded
    pub fn arg_type_mismatch(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Argument {
            key: key.into(),
            kind: ArgumentErrorKind::TypeMismatch,
            message: msg.into(),
        }
    }

    /// An argument is not accepted by the function
    pub fn unknown_arg(key: impl Into<String>, function: &str) -> Self {
        Self::Argument {
            key: key.into(),
            kind: ArgumentErrorKind::Unknown,
            message: format!("not supported by {}", function),
        }
    }

    /// An argument value is well-formed but not acceptable
    pub fn invalid_arg(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::arg_type_mismatch(key, msg)
    }

    /// Work failed in the given context
    pub fn execution(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Execution {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// A pod did not become ready
    pub fn pod_not_ready(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PodNotReady {
            namespace: namespace.into(),
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// A wait expired
    pub fn timeout(what: impl Into<String>, timeout: Duration, last_error: Option<String>) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
            last_error,
        }
    }

    /// The operation was cancelled
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Wrap an error with the phase and function it came from
    pub fn in_phase(self, phase: impl Into<String>, function: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            function: function.into(),
            source: Box::new(self),
        }
    }

    /// Name of the failed phase, if this error came from one
    pub fn phase_name(&self) -> Option<&str> {
        match self {
            Self::Phase { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// The innermost error, past any phase wrapping
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Blueprint mistakes (arguments, templates, dispatch) fail the same way
    /// on every attempt. Timeouts and unready pods may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Argument { .. }
            | Self::Template(_)
            | Self::FunctionNotFound { .. }
            | Self::DuplicateName { .. } => false,
            Self::Execution { .. } | Self::Aggregate { .. } | Self::Cancelled { .. } => false,
            Self::PodNotReady { .. } | Self::Timeout { .. } => true,
            Self::Phase { source, .. } => source.is_retryable(),
            Self::Common(e) => e.is_retryable(),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Common(err.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Common(err.into())
    }
}
