//! Engine integration test modules

mod actions;
mod fakes;
mod registry;
