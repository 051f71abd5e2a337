//! The process execution context.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{
    AssetHost, Bindings, ContainerHost, ContainerKey, Exclusive, ExclusiveState, Resumer,
    ScopeLocals, SourceEvent, ThreadState, WorkUnitId,
};
use crate::container::{Proceed, ResourceContainer};
use crate::error::{Escalation, ResourceError};
use crate::latch::Resumed;
use crate::resource::{Object, ResourceIndex, ResourceRegistry, ResourceScope};
use crate::source::{CompletionHandle, ReleaseCause};

/// Unique identifier for a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(Arc<str>);

impl ProcessId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::from(nanoid::nanoid!(12)))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process_{}", self.0)
    }
}

/// Per-invocation resource settings.
///
/// # Example
///
/// ```
/// use keel_system::context::ProcessConfig;
/// use keel_system::resource::{ResourceIndex, ResourceScope};
///
/// let request = ResourceIndex::new(ResourceScope::Process, 0);
/// let cache = ResourceIndex::new(ResourceScope::Process, 1);
///
/// let config = ProcessConfig::new()
///     .with_input(request, String::from("GET /"))
///     .with_instance(cache, 1);
/// ```
#[derive(Clone, Default)]
pub struct ProcessConfig {
    inputs: HashMap<ResourceIndex, Object>,
    instances: HashMap<ResourceIndex, usize>,
}

impl ProcessConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies the object for an input-bound resource.
    #[must_use]
    pub fn with_input<T: Send + Sync + 'static>(self, index: ResourceIndex, value: T) -> Self {
        self.with_input_object(index, crate::resource::object(value))
    }

    /// Supplies an already wrapped object for an input-bound resource.
    #[must_use]
    pub fn with_input_object(mut self, index: ResourceIndex, object: Object) -> Self {
        self.inputs.insert(index, object);
        self
    }

    /// Selects a non-default instance for a resource.
    #[must_use]
    pub fn with_instance(mut self, index: ResourceIndex, instance: usize) -> Self {
        self.instances.insert(index, instance);
        self
    }

    /// Checks the configuration against `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessConfigError`] for unbound indices, inputs supplied for
    /// resources that are not input-bound, and out-of-range instances.
    pub fn validate(&self, registry: &ResourceRegistry) -> Result<(), ProcessConfigError> {
        for &index in self.inputs.keys() {
            let bound = registry
                .get(index)
                .ok_or(ProcessConfigError::UnknownResource(index))?;
            if !bound.is_input_bound() {
                return Err(ProcessConfigError::NotInput(bound.name().to_owned()));
            }
        }
        for (&index, &instance) in &self.instances {
            let bound = registry
                .get(index)
                .ok_or(ProcessConfigError::UnknownResource(index))?;
            if instance >= bound.instances().len() {
                return Err(ProcessConfigError::InvalidInstance {
                    name: bound.name().to_owned(),
                    instance,
                    available: bound.instances().len(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("instances", &self.instances)
            .finish()
    }
}

/// Invalid per-invocation resource settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessConfigError {
    /// The index has nothing bound.
    #[error("no resource bound at {0}")]
    UnknownResource(ResourceIndex),
    /// An input was supplied for a resource that sources itself.
    #[error("resource is not input-bound: {0}")]
    NotInput(String),
    /// The selected instance does not exist.
    #[error("instance {instance} of '{name}' out of range ({available} available)")]
    InvalidInstance {
        /// Resource name.
        name: String,
        /// Requested instance.
        instance: usize,
        /// Number of instances bound.
        available: usize,
    },
}

/// The mutable part of a [`ProcessState`], reached through
/// [`ProcessState::run_exclusive`].
pub struct ProcessScope<C> {
    bindings: Arc<Bindings>,
    host: Weak<dyn ContainerHost>,
    containers: HashMap<ResourceIndex, ResourceContainer<C>>,
    resumed: Vec<Resumed<C>>,
    locals: ScopeLocals,
    unloaded: bool,
    abandoned: bool,
}

impl<C: Send + 'static> ExclusiveState for ProcessScope<C> {
    type Output = Resumed<C>;

    fn take_output(&mut self) -> Vec<Resumed<C>> {
        core::mem::take(&mut self.resumed)
    }
}

impl<C: Send + 'static> ProcessScope<C> {
    /// Makes sure the process-scoped resource at `index` has been sourced.
    ///
    /// Its dependencies must already be loaded (callers follow resolved load
    /// order); a missing or failed dependency fails this container too.
    pub fn ensure_loaded(&mut self, index: ResourceIndex, continuation: C) -> Proceed<C> {
        if !self.prepare(index) {
            return Proceed::Proceed(continuation);
        }
        let handle = CompletionHandle::new(self.host.clone(), ContainerKey::shared(index));
        let dependencies = match self.containers.get(&index) {
            Some(container) if container.needs_sourcing() => self.gather(container.dependencies()),
            _ => Ok(Vec::new()),
        };

        let Some(container) = self.containers.get_mut(&index) else {
            return Proceed::Proceed(continuation);
        };
        match dependencies {
            Ok(dependencies) => container.ensure_loaded(continuation, &dependencies, &handle),
            Err(cause) => {
                self.resumed.extend(container.fail_dependency(cause));
                Proceed::Proceed(continuation)
            }
        }
    }

    /// Checks that the loaded resource at `index` is usable right now.
    pub fn check_ready(&mut self, index: ResourceIndex, continuation: C) -> Proceed<C> {
        let handle = CompletionHandle::new(self.host.clone(), ContainerKey::shared(index));
        match self.containers.get_mut(&index) {
            Some(container) => container.check_ready(continuation, &handle),
            None => Proceed::Proceed(continuation),
        }
    }

    /// Returns the object of the resource at `index`.
    ///
    /// # Errors
    ///
    /// The container's failure, or [`ResourceError::NotLoaded`] /
    /// [`ResourceError::NotBound`] if it was never requested.
    pub fn object(&self, index: ResourceIndex) -> Result<Object, Escalation> {
        match self.containers.get(&index) {
            Some(container) => container.object().cloned(),
            None if self.bindings.registry.get(index).is_none() => {
                Err(ResourceError::NotBound(index).into())
            }
            None => Err(ResourceError::NotLoaded(self.bindings.registry.name_of(index)).into()),
        }
    }

    /// Returns the container at `index`, if it has been created.
    #[must_use]
    pub fn container(&self, index: ResourceIndex) -> Option<&ResourceContainer<C>> {
        self.containers.get(&index)
    }

    /// Returns the container at `index` mutably, if it has been created.
    pub fn container_mut(&mut self, index: ResourceIndex) -> Option<&mut ResourceContainer<C>> {
        self.containers.get_mut(&index)
    }

    /// Hands continuations to the resumer once this exclusive section ends.
    pub fn resume(&mut self, resumed: impl IntoIterator<Item = Resumed<C>>) {
        self.resumed.extend(resumed);
    }

    /// Returns storage for higher-layer per-process state.
    #[must_use]
    pub fn locals(&self) -> &ScopeLocals {
        &self.locals
    }

    /// Returns storage for higher-layer per-process state, mutably.
    pub fn locals_mut(&mut self) -> &mut ScopeLocals {
        &mut self.locals
    }

    /// Releases every process-scoped container, dependents first.
    ///
    /// Runs once; later calls do nothing.
    pub fn unload(&mut self, cause: ReleaseCause) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;
        let order: Vec<ResourceIndex> = self
            .bindings
            .unload_order()
            .filter(|index| index.scope() == ResourceScope::Process)
            .collect();
        for index in order {
            if let Some(container) = self.containers.get_mut(&index) {
                let abandoned = container.unload(cause);
                self.resumed.extend(abandoned);
            }
        }
    }

    /// Returns `true` once [`unload`](Self::unload) has run.
    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }

    fn prepare(&mut self, index: ResourceIndex) -> bool {
        if self.containers.contains_key(&index) {
            return true;
        }
        match self.bindings.container(ContainerKey::shared(index)) {
            Ok(mut container) => {
                if self.abandoned {
                    self.resumed.extend(container.abandon());
                }
                self.containers.insert(index, container);
                true
            }
            Err(error) => {
                tracing::warn!(%index, %error, "cannot create process container");
                false
            }
        }
    }

    fn gather(&self, dependencies: &[ResourceIndex]) -> Result<Vec<(ResourceIndex, Object)>, Escalation> {
        dependencies
            .iter()
            .map(|&dependency| Ok((dependency, self.object(dependency)?)))
            .collect()
    }

    fn apply(&mut self, key: ContainerKey, event: SourceEvent) {
        match self.containers.get_mut(&key.index()) {
            Some(container) => {
                let resumed = event.apply(container);
                self.resumed.extend(resumed);
            }
            None => tracing::debug!(?key, "event for unknown process container ignored"),
        }
    }

    fn expire(&mut self, now: Instant, timeout: Duration) {
        for container in self.containers.values_mut() {
            let resumed = container.expire(now, timeout);
            self.resumed.extend(resumed);
        }
    }

    fn abandon(&mut self) {
        self.abandoned = true;
        for container in self.containers.values_mut() {
            let resumed = container.abandon();
            self.resumed.extend(resumed);
        }
    }
}

/// State shared by every thread of one process.
///
/// Created per invocation. Owns the process-scoped containers and tracks the
/// live [`ThreadState`]s so timeouts and shutdown can reach them.
pub struct ProcessState<C: Send + 'static> {
    id: ProcessId,
    bindings: Arc<Bindings>,
    exclusive: Exclusive<ProcessScope<C>>,
    resumer: Arc<dyn Resumer<C>>,
    threads: Mutex<Vec<Weak<ThreadState<C>>>>,
    active_threads: AtomicUsize,
    next_thread: AtomicU64,
    next_work_unit: AtomicU64,
    ended: AtomicBool,
    abandoned: AtomicBool,
}

impl<C: Send + 'static> ProcessState<C> {
    /// Creates a process.
    ///
    /// `order` is the office-wide resolution order
    /// ([`ResourceRegistry::resolve_all`]); containers unload in reverse.
    /// Continuations let go by any latch in this process, or its threads, go
    /// to `resumer`.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        order: Arc<[ResourceIndex]>,
        config: ProcessConfig,
        resumer: impl Resumer<C>,
    ) -> Arc<Self> {
        let resumer: Arc<dyn Resumer<C>> = Arc::new(resumer);
        let bindings = Arc::new(Bindings {
            registry,
            order,
            inputs: config.inputs,
            instances: config.instances,
        });

        Arc::new_cyclic(|this: &Weak<Self>| {
            let host: Weak<dyn ContainerHost> = this.clone();
            let scope = ProcessScope {
                bindings: Arc::clone(&bindings),
                host,
                containers: HashMap::new(),
                resumed: Vec::new(),
                locals: ScopeLocals::new(),
                unloaded: false,
                abandoned: false,
            };
            let id = ProcessId::new();
            tracing::debug!(process = %id, "process created");

            Self {
                id,
                bindings,
                exclusive: Exclusive::new(scope, dispatcher(Arc::clone(&resumer))),
                resumer,
                threads: Mutex::new(Vec::new()),
                active_threads: AtomicUsize::new(0),
                next_thread: AtomicU64::new(0),
                next_work_unit: AtomicU64::new(0),
                ended: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
            }
        })
    }

    /// Returns the process identifier.
    #[must_use]
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Returns the registry resources are bound in.
    #[must_use]
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.bindings.registry
    }

    /// Runs `op` with exclusive access to the process scope.
    ///
    /// Must not be called from inside this process's own exclusive section.
    pub fn run_exclusive<R>(&self, op: impl FnOnce(&mut ProcessScope<C>) -> R) -> R {
        self.exclusive.run(op)
    }

    /// Queues `message` to run with exclusive access to the process scope.
    pub fn submit(&self, message: impl FnOnce(&mut ProcessScope<C>) + Send + 'static) {
        self.exclusive.submit(message);
    }

    /// Starts a new thread of execution in this process.
    pub fn spawn_thread(self: &Arc<Self>) -> Arc<ThreadState<C>> {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        self.active_threads.fetch_add(1, Ordering::AcqRel);

        let thread = ThreadState::new(
            id,
            Arc::clone(self),
            Arc::clone(&self.bindings),
            Arc::clone(&self.resumer),
        );
        let mut threads = self.threads.lock();
        threads.retain(|weak| weak.strong_count() > 0);
        threads.push(Arc::downgrade(&thread));
        thread
    }

    /// Records that one thread has finished. Returns `true` for the last one.
    pub fn thread_ended(&self) -> bool {
        let previous = self.active_threads.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(process = %self.id, remaining = previous.saturating_sub(1), "thread ended");
        previous <= 1
    }

    /// Returns the number of threads still running.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    /// Allocates an identifier for a function invocation.
    pub fn next_work_unit(&self) -> WorkUnitId {
        WorkUnitId(self.next_work_unit.fetch_add(1, Ordering::Relaxed))
    }

    /// Unloads the process-scoped containers and marks the process ended.
    pub fn end(&self, cause: ReleaseCause) {
        self.run_exclusive(|scope| scope.unload(cause));
        self.ended.store(true, Ordering::Release);
        tracing::debug!(process = %self.id, ?cause, "process ended");
    }

    /// Returns `true` once [`end`](Self::end) has run.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Returns `true` once shutdown has abandoned this process.
    ///
    /// Containers created after that point fail with
    /// [`ResourceError::ShuttingDown`] instead of sourcing.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn live_threads(&self) -> Vec<Arc<ThreadState<C>>> {
        self.threads.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl<C: Send + 'static> ContainerHost for ProcessState<C> {
    fn post(&self, key: ContainerKey, event: SourceEvent) {
        self.submit(move |scope| scope.apply(key, event));
    }
}

impl<C: Send + 'static> AssetHost for ProcessState<C> {
    fn check_timeouts(&self, now: Instant, timeout: Duration) {
        self.submit(move |scope| scope.expire(now, timeout));
        for thread in self.live_threads() {
            thread.submit(move |scope| scope.expire(now, timeout));
        }
    }

    fn abandon(&self) {
        tracing::debug!(process = %self.id, "abandoning pending resources");
        self.abandoned.store(true, Ordering::Release);
        self.submit(ProcessScope::abandon);
        for thread in self.live_threads() {
            thread.submit(super::ThreadScope::abandon);
        }
    }

    fn is_finished(&self) -> bool {
        self.is_ended()
    }
}

impl<C: Send + 'static> fmt::Debug for ProcessState<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("active_threads", &self.active_threads())
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

/// Adapts a resumer into an exclusive-section output sink.
pub(crate) fn dispatcher<C: Send + 'static>(
    resumer: Arc<dyn Resumer<C>>,
) -> impl Fn(Vec<Resumed<C>>) + Send + Sync + 'static {
    move |batch| {
        for resumed in batch {
            resumer.resume(resumed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceBinding, ResourceInstance, ResourceScope};
    use crate::source::{Sourced, source_fn};

    fn constant(value: u32) -> ResourceInstance {
        ResourceInstance::new(source_fn(move |_| Ok(Sourced::ready(value))))
    }

    fn registry() -> (ResourceRegistry, ResourceIndex, ResourceIndex) {
        let mut registry = ResourceRegistry::new();
        let request = registry
            .bind(ResourceBinding::new("request", ResourceScope::Process).input())
            .unwrap();
        let cache = registry
            .bind(
                ResourceBinding::new("cache", ResourceScope::Process)
                    .with_instance(constant(1))
                    .with_instance(constant(2)),
            )
            .unwrap();
        (registry, request, cache)
    }

    #[test]
    fn inputs_and_instances_in_range_are_accepted() {
        let (registry, request, cache) = registry();
        let config = ProcessConfig::new()
            .with_input(request, String::from("GET /"))
            .with_instance(cache, 1);
        assert_eq!(config.validate(&registry), Ok(()));
    }

    #[test]
    fn input_for_a_sourced_resource_is_rejected() {
        let (registry, _, cache) = registry();
        let config = ProcessConfig::new().with_input(cache, 7_u32);
        assert_eq!(
            config.validate(&registry),
            Err(ProcessConfigError::NotInput("cache".into()))
        );
    }

    #[test]
    fn out_of_range_instance_is_rejected() {
        let (registry, _, cache) = registry();
        let config = ProcessConfig::new().with_instance(cache, 5);
        assert_eq!(
            config.validate(&registry),
            Err(ProcessConfigError::InvalidInstance {
                name: "cache".into(),
                instance: 5,
                available: 2,
            })
        );
    }

    #[test]
    fn unbound_indices_are_rejected() {
        let (registry, _, _) = registry();
        let ghost = ResourceIndex::new(ResourceScope::Thread, 3);

        let config = ProcessConfig::new().with_instance(ghost, 0);
        assert_eq!(
            config.validate(&registry),
            Err(ProcessConfigError::UnknownResource(ghost))
        );

        let config = ProcessConfig::new().with_input(ghost, ());
        assert_eq!(
            config.validate(&registry),
            Err(ProcessConfigError::UnknownResource(ghost))
        );
    }
}
