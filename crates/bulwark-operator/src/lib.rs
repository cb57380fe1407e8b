//! Bulwark operator - runs the phases of blueprint actions requested by ActionSets
//!
//! The controller watches ActionSets, resolves each action against its
//! Blueprint, and executes it through the phase engine in
//! [`bulwark_engine`], mirroring phase states, outputs, artifacts and
//! progress back into `status`.

pub mod config;
pub mod controller;
pub mod controller_runner;
pub mod error;
pub mod execution;
pub mod status;

pub use config::Cli;
pub use controller::{error_policy, reconcile, Context};
pub use error::OperatorError;
