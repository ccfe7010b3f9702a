//! Library routine registry for lookup and discovery.

use crate::library;
use anyhow::{anyhow, Result};
use parafit_ir::FunctionDescriptor;
use std::sync::Arc;

/// Builds a routine for a given row length.
pub type RoutineFactory = Arc<dyn Fn(usize) -> Result<Arc<FunctionDescriptor>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct LibraryRegistry {
    routines: Vec<(String, RoutineFactory)>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            routines: Vec::new(),
        }
    }

    pub fn with_default_routines() -> Self {
        let mut registry = Self::new();
        registry.register("rand123", |_| library::rand123());
        registry.register("uniform_sampler", library::uniform_sampler);
        registry.register("gaussian_sampler", library::gaussian_sampler);
        registry.register("euclidean_norm", library::euclidean_norm);
        registry
    }

    /// Registers a factory, replacing any earlier one under the same name.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(usize) -> Result<Arc<FunctionDescriptor>> + Send + Sync + 'static,
    {
        self.routines.retain(|(existing, _)| existing != name);
        self.routines.push((name.to_string(), Arc::new(factory)));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routines.iter().map(|(name, _)| name.as_str())
    }

    pub fn find(&self, name: &str) -> Option<RoutineFactory> {
        self.routines
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, factory)| Arc::clone(factory))
    }

    /// Builds the routine `name` for rows of `length` values.
    pub fn instantiate(&self, name: &str, length: usize) -> Result<Arc<FunctionDescriptor>> {
        let factory = self
            .find(name)
            .ok_or_else(|| anyhow!("no library routine named `{name}`"))?;
        factory(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routines_are_discoverable() {
        let registry = LibraryRegistry::with_default_routines();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(
            names,
            vec!["rand123", "uniform_sampler", "gaussian_sampler", "euclidean_norm"]
        );
        let sampler = registry.instantiate("gaussian_sampler", 3).unwrap();
        assert_eq!(sampler.name(), "gaussian_sampler");
        assert_eq!(sampler.dependencies()[0].name(), "rand123");
        assert!(registry.instantiate("missing", 1).is_err());
    }

    #[test]
    fn registering_twice_replaces_the_factory() {
        let mut registry = LibraryRegistry::new();
        registry.register("norm", library::euclidean_norm);
        registry.register("norm", |_| library::rand123());
        assert_eq!(registry.names().count(), 1);
        assert_eq!(registry.instantiate("norm", 1).unwrap().name(), "rand123");
    }
}
