//! Composition of a routine and its dependencies into one source unit.

use crate::dialect::FunctionDescriptor;
use crate::error::CompositionError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// De-duplicated source unit, dependencies first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedSource {
    /// Routine names in emission order; the composed routine is last.
    pub order: Vec<String>,
    pub text: String,
}

impl ComposedSource {
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|entry| entry == name)
    }
}

/// Depth-first composition of `function` with everything it depends on.
///
/// Each distinct name is emitted once, in first-encountered order, before any
/// routine that uses it.
pub fn compose(function: &FunctionDescriptor) -> Result<ComposedSource, CompositionError> {
    let mut state = CompositionState::default();
    state.visit(function)?;
    Ok(ComposedSource {
        order: state.order,
        text: state.text,
    })
}

#[derive(Default)]
struct CompositionState<'a> {
    emitted: HashMap<&'a str, &'a str>,
    stack: Vec<&'a FunctionDescriptor>,
    order: Vec<String>,
    text: String,
}

impl<'a> CompositionState<'a> {
    fn visit(&mut self, function: &'a FunctionDescriptor) -> Result<(), CompositionError> {
        if let Some(pos) = self
            .stack
            .iter()
            .position(|active| active.name == function.name)
        {
            if self.stack[pos].source != function.source {
                return Err(CompositionError::NameCollision {
                    name: function.name.clone(),
                });
            }
            let mut path: Vec<String> = self.stack[pos..]
                .iter()
                .map(|active| active.name.clone())
                .collect();
            path.push(function.name.clone());
            return Err(CompositionError::Cycle { path });
        }

        if let Some(existing) = self.emitted.get(function.name.as_str()) {
            if *existing != function.source {
                return Err(CompositionError::NameCollision {
                    name: function.name.clone(),
                });
            }
            return Ok(());
        }

        self.stack.push(function);
        for dependency in &function.dependencies {
            self.visit(dependency)?;
        }
        self.stack.pop();

        self.emitted.insert(&function.name, &function.source);
        self.order.push(function.name.clone());
        let body = function.source.trim();
        if !body.is_empty() {
            self.text.push_str(body);
            self.text.push_str("\n\n");
        }
        Ok(())
    }
}

/// Caches composed units by descriptor identity.
///
/// Entries hold the descriptor weakly and are pruned once it is dropped, so
/// routines built per call do not accumulate.
#[derive(Default)]
pub struct FunctionRegistry {
    composed: Mutex<HashMap<usize, CachedUnit>>,
}

struct CachedUnit {
    function: Weak<FunctionDescriptor>,
    composed: Arc<ComposedSource>,
}

impl CachedUnit {
    fn is_live(&self) -> bool {
        self.function.strong_count() > 0
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compose(
        &self,
        function: &Arc<FunctionDescriptor>,
    ) -> Result<Arc<ComposedSource>, CompositionError> {
        let key = Arc::as_ptr(function) as usize;
        if let Ok(cache) = self.composed.lock() {
            if let Some(unit) = cache.get(&key).filter(|unit| unit.is_live()) {
                return Ok(Arc::clone(&unit.composed));
            }
        }

        let composed = Arc::new(compose(function)?);
        debug!(
            function = function.name(),
            routines = composed.order.len(),
            "composed routine unit"
        );

        if let Ok(mut cache) = self.composed.lock() {
            cache.retain(|_, unit| unit.is_live());
            cache.insert(
                key,
                CachedUnit {
                    function: Arc::downgrade(function),
                    composed: Arc::clone(&composed),
                },
            );
        }
        Ok(composed)
    }

    /// Cached units whose descriptor is still alive.
    pub fn len(&self) -> usize {
        self.composed
            .lock()
            .map(|cache| cache.values().filter(|unit| unit.is_live()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;

    fn routine(name: &str, deps: Vec<Arc<FunctionDescriptor>>) -> Arc<FunctionDescriptor> {
        FunctionBuilder::new(name)
            .source(format!("fn {name}() {{}}"))
            .dependencies(deps)
            .build()
            .unwrap()
    }

    #[test]
    fn diamond_emits_shared_dependency_once() {
        let d = routine("d", vec![]);
        let b = routine("b", vec![Arc::clone(&d)]);
        let c = routine("c", vec![Arc::clone(&d)]);
        let a = routine("a", vec![b, c]);

        let composed = compose(&a).unwrap();
        assert_eq!(composed.order, vec!["d", "b", "c", "a"]);
        assert_eq!(composed.text.matches("fn d()").count(), 1);
        assert!(composed.text.find("fn d()") < composed.text.find("fn b()"));
        assert!(composed.text.find("fn c()") < composed.text.find("fn a()"));
    }

    #[test]
    fn equal_bodies_under_one_name_are_merged() {
        let first = routine("shared", vec![]);
        let second = routine("shared", vec![]);
        let top = routine("top", vec![first, second]);
        let composed = compose(&top).unwrap();
        assert_eq!(composed.order, vec!["shared", "top"]);
    }

    #[test]
    fn distinct_bodies_under_one_name_collide() {
        let first = routine("helper", vec![]);
        let second = FunctionBuilder::new("helper")
            .source("fn helper() { let x = 1; }")
            .build()
            .unwrap();
        let top = routine("top", vec![first, second]);
        assert_eq!(
            compose(&top),
            Err(CompositionError::NameCollision {
                name: "helper".into()
            })
        );
    }

    #[test]
    fn name_cycles_are_detected() {
        let inner = routine("a", vec![]);
        let middle = routine("b", vec![inner]);
        let outer = routine("a", vec![middle]);
        match compose(&outer) {
            Err(CompositionError::Cycle { path }) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn registry_caches_by_identity() {
        let registry = FunctionRegistry::new();
        let d = routine("d", vec![]);
        let a = routine("a", vec![Arc::clone(&d)]);
        let first = registry.compose(&a).unwrap();
        let second = registry.compose(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        registry.compose(&d).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn dropped_routines_leave_the_cache() {
        let registry = FunctionRegistry::new();
        let shared = routine("shared", vec![]);
        for round in 0..5 {
            let top = routine("top", vec![Arc::clone(&shared)]);
            registry.compose(&top).unwrap();
            assert_eq!(registry.len(), 1, "round {round}");
        }
        assert_eq!(Arc::strong_count(&shared), 1);
        assert!(registry.is_empty());
    }
}
