//! The resource registry.

use hashbrown::HashMap;

use super::{BoundResource, ResourceBinding, ResourceIndex, ResourceScope};
use crate::resolver::{DependencyError, DependencyResolver};

/// Every resource bound for an office, addressed by [`ResourceIndex`].
///
/// Indices are dense per scope and assigned in binding order. The registry is
/// immutable once execution starts; processes and threads share it behind an
/// `Arc`.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    scopes: [Vec<BoundResource>; 3],
    names: HashMap<String, ResourceIndex>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a resource and returns its index.
    ///
    /// Dependencies may name resources bound later; they are checked when
    /// load order is resolved.
    ///
    /// # Errors
    ///
    /// - [`DependencyError::DuplicateName`] if the name is already bound
    /// - [`DependencyError::NoInstances`] if a non-input resource has no instance
    /// - [`DependencyError::InvalidDefaultInstance`] if the default is out of range
    pub fn bind(&mut self, binding: ResourceBinding) -> Result<ResourceIndex, DependencyError> {
        let ResourceBinding {
            name,
            scope,
            instances,
            default_instance,
            input_bound,
        } = binding;

        if self.names.contains_key(&name) {
            return Err(DependencyError::DuplicateName(name));
        }
        if instances.is_empty() && !input_bound {
            return Err(DependencyError::NoInstances(name));
        }
        if !instances.is_empty() && default_instance >= instances.len() {
            return Err(DependencyError::InvalidDefaultInstance {
                name,
                instance: default_instance,
                available: instances.len(),
            });
        }

        let slot = &mut self.scopes[scope.ordinal()];
        let index = ResourceIndex::new(scope, slot.len());
        tracing::debug!(resource = %name, %index, input_bound, "resource bound");

        self.names.insert(name.clone(), index);
        slot.push(BoundResource {
            name,
            index,
            instances,
            default_instance,
            input_bound,
        });
        Ok(index)
    }

    /// Returns the resource bound at `index`.
    #[must_use]
    pub fn get(&self, index: ResourceIndex) -> Option<&BoundResource> {
        self.scopes[index.scope().ordinal()].get(index.index())
    }

    /// Returns the index bound to `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<ResourceIndex> {
        self.names.get(name).copied()
    }

    /// Returns the display name for `index`, falling back to the index itself.
    #[must_use]
    pub fn name_of(&self, index: ResourceIndex) -> String {
        self.get(index)
            .map_or_else(|| index.to_string(), |bound| bound.name().to_owned())
    }

    /// Returns the number of resources bound in `scope`.
    #[must_use]
    pub fn len(&self, scope: ResourceScope) -> usize {
        self.scopes[scope.ordinal()].len()
    }

    /// Returns `true` if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.iter().all(Vec::is_empty)
    }

    /// Iterates over every bound resource, widest scope first.
    pub fn iter(&self) -> impl Iterator<Item = &BoundResource> {
        self.scopes.iter().flatten()
    }

    /// Resolves the load order for `consumer`, which directly needs `direct`.
    ///
    /// # Errors
    ///
    /// See [`DependencyResolver::resolve`].
    pub fn resolve(
        &self,
        consumer: &str,
        direct: &[ResourceIndex],
    ) -> Result<Vec<ResourceIndex>, DependencyError> {
        DependencyResolver::new(self).resolve(consumer, direct)
    }

    /// Resolves a single order covering every bound resource.
    ///
    /// Execution contexts unload their containers in the reverse of this
    /// order, so a resource is always released before the resources it
    /// depends on.
    ///
    /// # Errors
    ///
    /// See [`DependencyResolver::resolve`].
    pub fn resolve_all(&self) -> Result<Vec<ResourceIndex>, DependencyError> {
        let all: Vec<ResourceIndex> = self.iter().map(BoundResource::index).collect();
        DependencyResolver::new(self).resolve("<office>", &all)
    }
}
