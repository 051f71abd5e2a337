//! Resource scopes, indices and bindings.
//!
//! A resource is anything a function needs before it can run: a connection,
//! a parsed request, a transaction. Resources are bound into a
//! [`ResourceRegistry`] once, at assembly time, and sourced lazily at run time
//! inside the execution context that matches their [`ResourceScope`].
//!
//! | Scope | Container lives in | Unloaded when |
//! |-------|--------------------|---------------|
//! | [`ResourceScope::Process`] | the process state | the last thread of the process ends |
//! | [`ResourceScope::Thread`] | each thread state | that thread's chain completes |
//! | [`ResourceScope::Function`] | each function instance | that function (and its duties) completes |
//!
//! A resource may only depend on resources of the same or a wider scope, so
//! a process-scoped pool never waits on a thread-scoped transaction.
//!
//! # Example
//!
//! ```
//! use keel_system::resource::{ResourceBinding, ResourceInstance, ResourceRegistry, ResourceScope};
//! use keel_system::source::{source_fn, Sourced};
//!
//! let mut registry = ResourceRegistry::new();
//! let index = registry
//!     .bind(
//!         ResourceBinding::new("clock", ResourceScope::Thread)
//!             .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(0_u64))))),
//!     )
//!     .unwrap();
//!
//! assert_eq!(registry.index_of("clock"), Some(index));
//! ```

mod registry;

pub use registry::*;

use core::any::Any;
use core::fmt;
use std::sync::Arc;

use crate::source::ResourceSource;

/// A sourced resource value.
///
/// Objects are shared read-only between every function that uses the
/// resource. Interior mutability is up to the resource type.
pub type Object = Arc<dyn Any + Send + Sync>;

/// Wraps a value as an [`Object`].
pub fn object<T: Send + Sync + 'static>(value: T) -> Object {
    Arc::new(value)
}

/// The execution context a resource is bound to.
///
/// Scopes are ordered from widest to narrowest, so `Process < Thread < Function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceScope {
    /// One instance per process, shared by all of its threads.
    Process,
    /// One instance per thread of execution.
    Thread,
    /// One instance per function invocation.
    Function,
}

impl ResourceScope {
    /// All scopes, widest first.
    pub const ALL: [ResourceScope; 3] = [Self::Process, Self::Thread, Self::Function];

    /// Returns the ordinal used for tie-breaking in dependency order.
    #[must_use]
    pub const fn ordinal(self) -> usize {
        match self {
            Self::Process => 0,
            Self::Thread => 1,
            Self::Function => 2,
        }
    }

    /// Returns `true` if a resource in `self` may depend on one in `dependency`.
    #[must_use]
    pub fn may_depend_on(self, dependency: ResourceScope) -> bool {
        dependency <= self
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "thread"),
            Self::Function => write!(f, "function"),
        }
    }
}

/// Identifies a bound resource: its scope plus a dense position within it.
///
/// Ordering compares scope first, then position, which is the deterministic
/// tie-break used when resolving load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIndex {
    scope: ResourceScope,
    index: usize,
}

impl ResourceIndex {
    /// Creates an index.
    #[must_use]
    pub const fn new(scope: ResourceScope, index: usize) -> Self {
        Self { scope, index }
    }

    /// Returns the scope.
    #[must_use]
    pub const fn scope(&self) -> ResourceScope {
        self.scope
    }

    /// Returns the position within the scope.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.index)
    }
}

/// Identifies a governance registered with the office.
///
/// Declared here so resource instances can name the governances that
/// automatically oversee them once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GovernanceIndex(pub usize);

impl fmt::Display for GovernanceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "governance_{}", self.0)
    }
}

/// One concrete way of providing a resource.
///
/// A [`BoundResource`] has one or more instances; a process picks one of them
/// (the default unless overridden at invocation).
#[derive(Clone)]
pub struct ResourceInstance {
    source: Arc<dyn ResourceSource>,
    dependencies: Vec<ResourceIndex>,
    governance: Vec<GovernanceIndex>,
}

impl ResourceInstance {
    /// Creates an instance provided by `source`.
    #[must_use]
    pub fn new(source: impl ResourceSource) -> Self {
        Self::from_arc(Arc::new(source))
    }

    /// Creates an instance from an already shared source.
    #[must_use]
    pub fn from_arc(source: Arc<dyn ResourceSource>) -> Self {
        Self {
            source,
            dependencies: Vec::new(),
            governance: Vec::new(),
        }
    }

    /// Declares a resource that must be ready before this one is sourced.
    #[must_use]
    pub fn depends_on(mut self, dependency: ResourceIndex) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Declares a governance that oversees this resource while it is active.
    #[must_use]
    pub fn governed_by(mut self, governance: GovernanceIndex) -> Self {
        if !self.governance.contains(&governance) {
            self.governance.push(governance);
        }
        self
    }

    /// Returns the source.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn ResourceSource> {
        &self.source
    }

    /// Returns the direct dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[ResourceIndex] {
        &self.dependencies
    }

    /// Returns the governances overseeing this instance.
    #[must_use]
    pub fn governance(&self) -> &[GovernanceIndex] {
        &self.governance
    }
}

impl fmt::Debug for ResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceInstance")
            .field("dependencies", &self.dependencies)
            .field("governance", &self.governance)
            .finish_non_exhaustive()
    }
}

/// Describes a resource to bind into a [`ResourceRegistry`].
///
/// # Example
///
/// ```
/// use keel_system::resource::{ResourceBinding, ResourceInstance, ResourceScope};
/// use keel_system::source::{source_fn, Sourced};
///
/// let binding = ResourceBinding::new("request", ResourceScope::Process).input();
/// let cache = ResourceBinding::new("cache", ResourceScope::Process)
///     .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready("memory")))))
///     .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready("redis")))))
///     .with_default_instance(1);
/// ```
#[derive(Debug)]
pub struct ResourceBinding {
    name: String,
    scope: ResourceScope,
    instances: Vec<ResourceInstance>,
    default_instance: usize,
    input_bound: bool,
}

impl ResourceBinding {
    /// Starts a binding for `name` in `scope`.
    #[must_use]
    pub fn new(name: impl Into<String>, scope: ResourceScope) -> Self {
        Self {
            name: name.into(),
            scope,
            instances: Vec::new(),
            default_instance: 0,
            input_bound: false,
        }
    }

    /// Adds an instance.
    #[must_use]
    pub fn with_instance(mut self, instance: ResourceInstance) -> Self {
        self.instances.push(instance);
        self
    }

    /// Selects which instance is used when a process does not override it.
    #[must_use]
    pub fn with_default_instance(mut self, instance: usize) -> Self {
        self.default_instance = instance;
        self
    }

    /// Marks the resource as supplied by the caller at process invocation.
    ///
    /// Input-bound resources need no instance. If one is given it is used
    /// only to release the supplied object.
    #[must_use]
    pub fn input(mut self) -> Self {
        self.input_bound = true;
        self
    }
}

/// A resource as stored in the registry.
#[derive(Debug)]
pub struct BoundResource {
    name: String,
    index: ResourceIndex,
    instances: Vec<ResourceInstance>,
    default_instance: usize,
    input_bound: bool,
}

impl BoundResource {
    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resource index.
    #[must_use]
    pub fn index(&self) -> ResourceIndex {
        self.index
    }

    /// Returns the scope.
    #[must_use]
    pub fn scope(&self) -> ResourceScope {
        self.index.scope()
    }

    /// Returns all instances.
    #[must_use]
    pub fn instances(&self) -> &[ResourceInstance] {
        &self.instances
    }

    /// Returns the instance at `position`.
    #[must_use]
    pub fn instance(&self, position: usize) -> Option<&ResourceInstance> {
        self.instances.get(position)
    }

    /// Returns the position of the default instance.
    #[must_use]
    pub fn default_instance(&self) -> usize {
        self.default_instance
    }

    /// Returns `true` if the resource is supplied at invocation.
    #[must_use]
    pub fn is_input_bound(&self) -> bool {
        self.input_bound
    }

    /// Returns the union of every instance's dependencies, ordered and deduplicated.
    ///
    /// Load order is resolved over this union so that any instance can be
    /// selected at invocation without re-resolving.
    #[must_use]
    pub fn all_dependencies(&self) -> Vec<ResourceIndex> {
        let mut all: Vec<ResourceIndex> = self
            .instances
            .iter()
            .flat_map(|instance| instance.dependencies().iter().copied())
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}
