//! Property tests for dependency resolution.
//!
//! Random dependency graphs are bound into a registry and resolved; the
//! resulting order (or error) is checked against a straightforward
//! reachability model.

use std::collections::BTreeSet;

use keel_system::resolver::DependencyError;
use keel_system::resource::{
    ResourceBinding, ResourceIndex, ResourceInstance, ResourceRegistry, ResourceScope,
};
use keel_system::source::{Sourced, source_fn};
use proptest::prelude::*;

// ─────────────────────────────────────────────────────────────────────────────
// Graph model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Graph {
    /// Scope of node `i`.
    scopes: Vec<ResourceScope>,
    /// `edges[i]` lists the nodes `i` depends on.
    edges: Vec<Vec<usize>>,
    /// Nodes the consumer uses directly.
    roots: Vec<usize>,
}

impl Graph {
    fn node_count(&self) -> usize {
        self.edges.len()
    }

    /// Binds every node, returning the registry and each node's index.
    fn bind(&self) -> (ResourceRegistry, Vec<ResourceIndex>) {
        let mut counts = [0usize; 3];
        let indices: Vec<ResourceIndex> = self
            .scopes
            .iter()
            .map(|&scope| {
                let slot = &mut counts[scope.ordinal()];
                let index = ResourceIndex::new(scope, *slot);
                *slot += 1;
                index
            })
            .collect();

        let mut registry = ResourceRegistry::new();
        for (node, deps) in self.edges.iter().enumerate() {
            let instance = deps.iter().fold(
                ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(())))),
                |instance, &dep| instance.depends_on(indices[dep]),
            );
            registry
                .bind(ResourceBinding::new(format!("r{node}"), self.scopes[node]).with_instance(instance))
                .expect("bind");
        }
        (registry, indices)
    }

    /// Every node reachable from `start` by following dependency edges.
    fn reachable_from(&self, start: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = self.edges[start].clone();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.edges[node].iter().copied());
            }
        }
        seen
    }

    /// Roots plus everything they reach.
    fn closure(&self) -> BTreeSet<usize> {
        let mut all: BTreeSet<usize> = self.roots.iter().copied().collect();
        for &root in &self.roots {
            all.extend(self.reachable_from(root));
        }
        all
    }

    fn has_cycle_in_closure(&self) -> bool {
        self.closure()
            .into_iter()
            .any(|node| self.reachable_from(node).contains(&node))
    }
}

/// Scopes are non-decreasing in node order, so edges to lower nodes always
/// point at the same or a wider scope.
fn arb_scopes(n: usize) -> impl Strategy<Value = Vec<ResourceScope>> {
    (0..=n, 0..=n).prop_map(move |(a, b)| {
        let (thread_from, function_from) = (a.min(b), a.max(b));
        (0..n)
            .map(|i| {
                if i >= function_from {
                    ResourceScope::Function
                } else if i >= thread_from {
                    ResourceScope::Thread
                } else {
                    ResourceScope::Process
                }
            })
            .collect()
    })
}

/// Acyclic graphs: node `i` only depends on nodes below it.
fn arb_dag() -> impl Strategy<Value = Graph> {
    (1..=24usize).prop_flat_map(|n| {
        let edges = prop::collection::vec(prop::collection::btree_set(0..n, 0..4), n).prop_map(
            |sets| {
                sets.into_iter()
                    .enumerate()
                    .map(|(i, set)| set.into_iter().filter(|&d| d < i).collect())
                    .collect::<Vec<Vec<usize>>>()
            },
        );
        let roots = prop::collection::vec(0..n, 1..=4);
        (arb_scopes(n), edges, roots).prop_map(|(scopes, edges, roots)| Graph {
            scopes,
            edges,
            roots,
        })
    })
}

/// Arbitrary graphs in a single scope, cycles allowed.
fn arb_graph() -> impl Strategy<Value = Graph> {
    (1..=16usize).prop_flat_map(|n| {
        let edges = prop::collection::vec(
            prop::collection::btree_set(0..n, 0..3).prop_map(|set| set.into_iter().collect::<Vec<usize>>()),
            n,
        );
        let roots = prop::collection::vec(0..n, 1..=3);
        (edges, roots).prop_map(move |(edges, roots)| Graph {
            scopes: vec![ResourceScope::Process; n],
            edges,
            roots,
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// An acyclic graph resolves to exactly its closure, each resource once,
    /// every resource after all of its transitive dependencies.
    #[test]
    fn prop_acyclic_order_respects_dependencies(graph in arb_dag()) {
        let (registry, indices) = graph.bind();
        let roots: Vec<ResourceIndex> = graph.roots.iter().map(|&r| indices[r]).collect();

        let order = registry.resolve("consumer", &roots).expect("acyclic graph resolves");

        let expected: BTreeSet<ResourceIndex> = graph.closure().into_iter().map(|n| indices[n]).collect();
        let produced: BTreeSet<ResourceIndex> = order.iter().copied().collect();
        prop_assert_eq!(produced.len(), order.len(), "duplicates in order");
        prop_assert_eq!(&produced, &expected);

        let position = |index: ResourceIndex| order.iter().position(|&i| i == index);
        for node in graph.closure() {
            for dep in graph.reachable_from(node) {
                prop_assert!(
                    position(indices[dep]) < position(indices[node]),
                    "r{} must load before r{}", dep, node
                );
            }
        }
    }

    /// Resolution is deterministic for the same registry and roots.
    #[test]
    fn prop_order_is_deterministic(graph in arb_dag()) {
        let (registry, indices) = graph.bind();
        let roots: Vec<ResourceIndex> = graph.roots.iter().map(|&r| indices[r]).collect();
        let mut reversed = roots.clone();
        reversed.reverse();

        prop_assert_eq!(
            registry.resolve("consumer", &roots).expect("resolves"),
            registry.resolve("consumer", &reversed).expect("resolves")
        );
    }

    /// Resolution fails exactly when the closure contains a cycle, and the
    /// reported pair really do depend on each other.
    #[test]
    fn prop_cycles_are_always_reported(graph in arb_graph()) {
        let (registry, indices) = graph.bind();
        let roots: Vec<ResourceIndex> = graph.roots.iter().map(|&r| indices[r]).collect();

        match registry.resolve("consumer", &roots) {
            Ok(order) => {
                prop_assert!(!graph.has_cycle_in_closure(), "cycle missed");
                prop_assert_eq!(order.len(), graph.closure().len());
            }
            Err(DependencyError::Cycle(cycle)) => {
                prop_assert!(graph.has_cycle_in_closure(), "spurious cycle");
                prop_assert!(cycle.first <= cycle.second);

                let node = |name: &str| -> usize { name[1..].parse().expect("node name") };
                let (a, b) = (node(&cycle.first), node(&cycle.second));
                prop_assert!(graph.reachable_from(a).contains(&b));
                prop_assert!(graph.reachable_from(b).contains(&a));
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }
}

/// A lone resource with no dependencies resolves to itself.
#[test]
fn single_node_graph_resolves_to_itself() {
    let graph = Graph {
        scopes: vec![ResourceScope::Thread],
        edges: vec![Vec::new()],
        roots: vec![0],
    };
    assert_eq!(graph.node_count(), 1);

    let (registry, indices) = graph.bind();
    assert_eq!(registry.resolve("consumer", &indices).unwrap(), indices);
}
