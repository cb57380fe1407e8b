//! Phase-execution engine for Bulwark blueprints
//!
//! Runs the phases of one blueprint action in order:
//! - Functions are looked up by name in a [`FunctionRegistry`]
//! - Arguments render against [`TemplateParams`] and bind through a weakly-typed decoder
//! - Each phase's output is threaded forward to the phases after it
//! - A defer phase runs last whatever happened before it
//!
//! Cluster access goes through [`cluster::ClusterClient`] and pod lifecycles
//! through [`pod::PodController`], so everything here can run against fakes.

#![deny(missing_docs)]

pub mod args;
pub mod cluster;
pub mod context;
pub mod error;
pub mod fanout;
pub mod function;
pub mod functions;
pub mod jsonpath;
pub mod output;
pub mod param;
pub mod phase;
pub mod pod;
pub mod poll;
pub mod progress;
pub mod registry;
pub mod waiter;

pub use args::Args;
pub use context::{EngineConfig, ExecContext};
pub use error::Error;
pub use function::{Function, PhaseProgress};
pub use output::Output;
pub use param::TemplateParams;
pub use phase::{ActionRun, NoopObserver, PhaseExecutor, PhaseObserver, PhaseRecord};
pub use registry::FunctionRegistry;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;
