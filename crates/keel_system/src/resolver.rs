//! Dependency ordering for resources.
//!
//! Given the resources a consumer uses directly, [`DependencyResolver`]
//! computes the full closure of what must be loaded and the order to load it
//! in: every resource after all of its transitive dependencies.
//!
//! The ordering is deterministic. Among resources with no dependency relation
//! between them, fewer transitive dependencies come first, then the narrower
//! [`ResourceIndex`] ordering (scope, then position).
//!
//! Cycles are reported as a [`CycleError`] naming two resources that depend
//! on each other, never as a partial order.

use core::cmp::Ordering;
use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use crate::resource::{ResourceIndex, ResourceRegistry, ResourceScope};

/// Two resources that transitively depend on each other.
///
/// Names are stored in lexicographic order, so the same cycle always produces
/// the same error regardless of where resolution started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// The lexicographically smaller name.
    pub first: String,
    /// The lexicographically larger name.
    pub second: String,
}

impl CycleError {
    /// Creates a cycle error for `a` and `b`, in either order.
    #[must_use]
    pub fn between(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            first: first.to_owned(),
            second: second.to_owned(),
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.second {
            write!(f, "resource '{}' depends on itself", self.first)
        } else {
            write!(
                f,
                "cyclic dependency between '{}' and '{}'",
                self.first, self.second
            )
        }
    }
}

impl core::error::Error for CycleError {}

/// Errors from binding resources or resolving their load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// Two resources depend on each other.
    Cycle(CycleError),
    /// A dependency names an index with nothing bound.
    Unresolved {
        /// The resource or function that declared the dependency.
        consumer: String,
        /// The missing index.
        dependency: ResourceIndex,
    },
    /// A resource depends on one with a narrower scope.
    ScopeViolation {
        /// The dependent resource.
        consumer: String,
        /// Its scope.
        consumer_scope: ResourceScope,
        /// The dependency.
        dependency: String,
        /// The dependency's (narrower) scope.
        dependency_scope: ResourceScope,
    },
    /// A resource name was bound twice.
    DuplicateName(String),
    /// A non-input resource was bound without any instance.
    NoInstances(String),
    /// The default instance does not exist.
    InvalidDefaultInstance {
        /// Resource name.
        name: String,
        /// Requested default.
        instance: usize,
        /// Number of instances bound.
        available: usize,
    },
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyError::Cycle(cycle) => write!(f, "{cycle}"),
            DependencyError::Unresolved {
                consumer,
                dependency,
            } => write!(f, "'{consumer}' depends on unbound resource {dependency}"),
            DependencyError::ScopeViolation {
                consumer,
                consumer_scope,
                dependency,
                dependency_scope,
            } => write!(
                f,
                "{consumer_scope} resource '{consumer}' cannot depend on {dependency_scope} resource '{dependency}'"
            ),
            DependencyError::DuplicateName(name) => write!(f, "resource already bound: {name}"),
            DependencyError::NoInstances(name) => write!(f, "resource has no instances: {name}"),
            DependencyError::InvalidDefaultInstance {
                name,
                instance,
                available,
            } => write!(
                f,
                "default instance {instance} of '{name}' out of range ({available} available)"
            ),
        }
    }
}

impl core::error::Error for DependencyError {}

impl From<CycleError> for DependencyError {
    fn from(cycle: CycleError) -> Self {
        DependencyError::Cycle(cycle)
    }
}

/// A resource in the closure, with its full transitive dependency set.
struct Resolved<'r> {
    index: ResourceIndex,
    name: &'r str,
    dependencies: BTreeSet<ResourceIndex>,
}

/// Orders two resolved resources.
///
/// A resource that depends on the other sorts after it. Unrelated resources
/// fall back to dependency count, then index. Mutual dependency (including a
/// resource reaching itself) is a cycle.
fn compare(a: &Resolved<'_>, b: &Resolved<'_>) -> Result<Ordering, CycleError> {
    let a_needs_b = a.dependencies.contains(&b.index);
    let b_needs_a = b.dependencies.contains(&a.index);

    match (a_needs_b, b_needs_a) {
        (true, true) => Err(CycleError::between(a.name, b.name)),
        (true, false) => Ok(Ordering::Greater),
        (false, true) => Ok(Ordering::Less),
        (false, false) => Ok(a
            .dependencies
            .len()
            .cmp(&b.dependencies.len())
            .then(a.index.cmp(&b.index))),
    }
}

/// Computes load orders against a [`ResourceRegistry`].
pub struct DependencyResolver<'r> {
    registry: &'r ResourceRegistry,
}

impl<'r> DependencyResolver<'r> {
    /// Creates a resolver over `registry`.
    #[must_use]
    pub fn new(registry: &'r ResourceRegistry) -> Self {
        Self { registry }
    }

    /// Returns the load order for `consumer`, which directly uses `direct`.
    ///
    /// The result contains every resource reachable from `direct` exactly
    /// once, each after all of its transitive dependencies. Dependencies are
    /// the union over all of a resource's instances.
    ///
    /// # Errors
    ///
    /// - [`DependencyError::Unresolved`] if any reachable index is unbound
    /// - [`DependencyError::ScopeViolation`] if a resource depends on a narrower scope
    /// - [`DependencyError::Cycle`] if any two reachable resources depend on each other
    pub fn resolve(
        &self,
        consumer: &str,
        direct: &[ResourceIndex],
    ) -> Result<Vec<ResourceIndex>, DependencyError> {
        let closure = self.closure(consumer, direct)?;

        let resolved: BTreeMap<ResourceIndex, Resolved<'r>> = closure
            .iter()
            .map(|(&index, &name)| {
                let dependencies = self.transitive(index);
                (
                    index,
                    Resolved {
                        index,
                        name,
                        dependencies,
                    },
                )
            })
            .collect();

        Self::detect_cycles(&resolved)?;

        let mut order: Vec<&Resolved<'r>> = resolved.values().collect();
        // Acyclic here: a dependency always has strictly fewer transitive
        // dependencies than its dependent, so this key agrees with `compare`.
        order.sort_by_key(|r| (r.dependencies.len(), r.index));

        tracing::trace!(
            consumer,
            resources = order.len(),
            "resolved resource load order"
        );
        Ok(order.into_iter().map(|r| r.index).collect())
    }

    /// Collects every reachable resource, validating bindings and scopes.
    fn closure(
        &self,
        consumer: &str,
        direct: &[ResourceIndex],
    ) -> Result<BTreeMap<ResourceIndex, &'r str>, DependencyError> {
        let mut reached: BTreeMap<ResourceIndex, &'r str> = BTreeMap::new();
        let mut stack: Vec<(ResourceIndex, String)> = direct
            .iter()
            .map(|&index| (index, consumer.to_owned()))
            .collect();

        while let Some((index, dependent)) = stack.pop() {
            if reached.contains_key(&index) {
                continue;
            }
            let Some(bound) = self.registry.get(index) else {
                return Err(DependencyError::Unresolved {
                    consumer: dependent,
                    dependency: index,
                });
            };
            reached.insert(index, bound.name());

            for dependency in bound.all_dependencies() {
                if let Some(target) = self.registry.get(dependency)
                    && !bound.scope().may_depend_on(target.scope())
                {
                    return Err(DependencyError::ScopeViolation {
                        consumer: bound.name().to_owned(),
                        consumer_scope: bound.scope(),
                        dependency: target.name().to_owned(),
                        dependency_scope: target.scope(),
                    });
                }
                stack.push((dependency, bound.name().to_owned()));
            }
        }

        Ok(reached)
    }

    /// Returns every resource `start` reaches by following dependency edges.
    ///
    /// `start` itself is included only if it lies on a cycle.
    fn transitive(&self, start: ResourceIndex) -> BTreeSet<ResourceIndex> {
        let mut seen = BTreeSet::new();
        let mut stack = self
            .registry
            .get(start)
            .map(|bound| bound.all_dependencies())
            .unwrap_or_default();

        while let Some(index) = stack.pop() {
            if !seen.insert(index) {
                continue;
            }
            if let Some(bound) = self.registry.get(index) {
                stack.extend(bound.all_dependencies());
            }
        }

        seen
    }

    /// Checks every dependency pair in index order and reports the first cycle.
    fn detect_cycles(resolved: &BTreeMap<ResourceIndex, Resolved<'_>>) -> Result<(), CycleError> {
        for a in resolved.values() {
            // Prefer naming a second resource over reporting a self-loop.
            for b in a
                .dependencies
                .iter()
                .filter(|&&b| b != a.index)
                .filter_map(|b| resolved.get(b))
            {
                compare(a, b)?;
            }
            if a.dependencies.contains(&a.index) {
                compare(a, a)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceBinding, ResourceInstance};
    use crate::source::{Sourced, source_fn};

    fn instance(dependencies: &[ResourceIndex]) -> ResourceInstance {
        dependencies.iter().fold(
            ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(())))),
            |instance, &dependency| instance.depends_on(dependency),
        )
    }

    fn process(index: usize) -> ResourceIndex {
        ResourceIndex::new(ResourceScope::Process, index)
    }

    /// Binds process-scoped resources named by `names`, with `edges[i]` listing
    /// the positions resource `i` depends on.
    fn registry(names: &[&str], edges: &[&[usize]]) -> ResourceRegistry {
        let mut registry = ResourceRegistry::new();
        for (name, deps) in names.iter().zip(edges) {
            let deps: Vec<ResourceIndex> = deps.iter().map(|&d| process(d)).collect();
            registry
                .bind(ResourceBinding::new(*name, ResourceScope::Process).with_instance(instance(&deps)))
                .unwrap();
        }
        registry
    }

    #[test]
    fn single_chain_loads_leaf_first() {
        // A -> B -> C
        let registry = registry(&["A", "B", "C"], &[&[1], &[2], &[]]);
        let order = registry.resolve("F", &[process(0)]).unwrap();
        assert_eq!(order, vec![process(2), process(1), process(0)]);
    }

    #[test]
    fn shared_dependency_appears_once() {
        // A -> C, B -> C
        let registry = registry(&["A", "B", "C"], &[&[2], &[2], &[]]);
        let order = registry.resolve("F", &[process(0), process(1)]).unwrap();

        assert_eq!(order.len(), 3);
        assert_eq!(order[0], process(2));
        assert_eq!(&order[1..], &[process(0), process(1)]);
    }

    #[test]
    fn mutual_dependency_is_a_cycle() {
        // A -> B -> A
        let registry = registry(&["B", "A"], &[&[1], &[0]]);
        let err = registry.resolve("F", &[process(0)]).unwrap_err();

        assert_eq!(err, DependencyError::Cycle(CycleError::between("A", "B")));
        assert_eq!(err.to_string(), "cyclic dependency between 'A' and 'B'");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = registry(&["loop"], &[&[0]]);
        let err = registry.resolve("F", &[process(0)]).unwrap_err();

        assert_eq!(err, DependencyError::Cycle(CycleError::between("loop", "loop")));
    }

    #[test]
    fn longer_cycle_names_two_members() {
        // A -> B -> C -> A, D -> A
        let registry = registry(&["A", "B", "C", "D"], &[&[1], &[2], &[0], &[0]]);
        let err = registry.resolve("F", &[process(3)]).unwrap_err();

        let DependencyError::Cycle(cycle) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_ne!(cycle.first, "D");
        assert_ne!(cycle.second, "D");
        assert!(cycle.first < cycle.second);
    }

    #[test]
    fn unbound_dependency_is_unresolved() {
        let registry = registry(&["A"], &[&[7]]);
        let err = registry.resolve("F", &[process(0)]).unwrap_err();

        assert_eq!(
            err,
            DependencyError::Unresolved {
                consumer: "A".into(),
                dependency: process(7),
            }
        );
    }

    #[test]
    fn unbound_direct_use_names_the_consumer() {
        let registry = registry(&[], &[]);
        let err = registry.resolve("F", &[process(0)]).unwrap_err();

        assert!(matches!(err, DependencyError::Unresolved { consumer, .. } if consumer == "F"));
    }

    #[test]
    fn wider_scope_cannot_depend_on_narrower() {
        let mut registry = ResourceRegistry::new();
        let tx = registry
            .bind(ResourceBinding::new("tx", ResourceScope::Thread).with_instance(instance(&[])))
            .unwrap();
        let pool = registry
            .bind(ResourceBinding::new("pool", ResourceScope::Process).with_instance(instance(&[tx])))
            .unwrap();

        let err = registry.resolve("F", &[pool]).unwrap_err();
        assert!(matches!(err, DependencyError::ScopeViolation { .. }));
    }

    #[test]
    fn unrelated_resources_tie_break_on_scope_then_index() {
        let mut registry = ResourceRegistry::new();
        let f = registry
            .bind(ResourceBinding::new("f", ResourceScope::Function).with_instance(instance(&[])))
            .unwrap();
        let t = registry
            .bind(ResourceBinding::new("t", ResourceScope::Thread).with_instance(instance(&[])))
            .unwrap();
        let p = registry
            .bind(ResourceBinding::new("p", ResourceScope::Process).with_instance(instance(&[])))
            .unwrap();

        assert_eq!(registry.resolve("F", &[f, t, p]).unwrap(), vec![p, t, f]);
    }

    #[test]
    fn union_of_instance_dependencies_is_loaded() {
        let mut registry = ResourceRegistry::new();
        let a = registry
            .bind(ResourceBinding::new("a", ResourceScope::Process).with_instance(instance(&[])))
            .unwrap();
        let b = registry
            .bind(ResourceBinding::new("b", ResourceScope::Process).with_instance(instance(&[])))
            .unwrap();
        let either = registry
            .bind(
                ResourceBinding::new("either", ResourceScope::Process)
                    .with_instance(instance(&[a]))
                    .with_instance(instance(&[b])),
            )
            .unwrap();

        assert_eq!(registry.resolve("F", &[either]).unwrap(), vec![a, b, either]);
    }
}
