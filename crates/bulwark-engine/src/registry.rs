//! Name → function lookup table

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::function::Function;
use crate::functions;
use crate::{Error, Result};

/// Functions available to blueprints, keyed by name
///
/// Built once at wire-up and shared; lookups are safe from any task.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<dyn Function>>,
}

impl FunctionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in function
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        for function in functions::builtins() {
            registry.register(function)?;
        }
        Ok(registry)
    }

    /// Add a function under its name
    ///
    /// A second function with the same name is rejected and the first stays
    /// registered.
    pub fn register(&self, function: Arc<dyn Function>) -> Result<()> {
        let name = function.name().to_string();
        match self.functions.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(Error::DuplicateName {
                name: entry.key().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!(function = %entry.key(), "registered function");
                entry.insert(function);
                Ok(())
            }
        }
    }

    /// Look up a function by name
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).map(|f| f.value().clone())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
