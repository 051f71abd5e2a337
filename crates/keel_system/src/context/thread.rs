//! The thread execution context.

use core::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use super::process::dispatcher;
use super::{
    Bindings, ContainerHost, ContainerKey, Exclusive, ExclusiveState, ProcessState, Resumer,
    ScopeLocals, SourceEvent, WorkUnitId,
};
use crate::container::{Proceed, ResourceContainer};
use crate::error::{Escalation, ResourceError};
use crate::latch::{ResourceLatch, Resumed};
use crate::resource::{Object, ResourceIndex, ResourceScope};
use crate::source::{CompletionHandle, ReleaseCause};

/// Identifies a thread of execution within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadStateId(pub u64);

impl fmt::Display for ThreadStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread_{}", self.0)
    }
}

/// The mutable part of a [`ThreadState`], reached through
/// [`ThreadState::run_exclusive`] or a submitted message.
///
/// Owns the thread-scoped containers, the function-scoped containers of every
/// work unit running in the thread, and one latch per work unit for
/// higher-layer waits (such as asynchronous sub-operations).
pub struct ThreadScope<C: Send + 'static> {
    id: ThreadStateId,
    process: Arc<ProcessState<C>>,
    bindings: Arc<Bindings>,
    host: Weak<dyn ContainerHost>,
    containers: HashMap<ContainerKey, ResourceContainer<C>>,
    latches: HashMap<WorkUnitId, (String, ResourceLatch<C>)>,
    resumed: Vec<Resumed<C>>,
    locals: ScopeLocals,
}

impl<C: Send + 'static> ExclusiveState for ThreadScope<C> {
    type Output = Resumed<C>;

    fn take_output(&mut self) -> Vec<Resumed<C>> {
        core::mem::take(&mut self.resumed)
    }
}

impl<C: Send + 'static> ThreadScope<C> {
    /// Returns the thread identifier.
    #[must_use]
    pub fn id(&self) -> ThreadStateId {
        self.id
    }

    /// Returns the owning process.
    #[must_use]
    pub fn process(&self) -> &Arc<ProcessState<C>> {
        &self.process
    }

    /// Makes sure the resource at `index` has been sourced for `work_unit`.
    ///
    /// Process-scoped resources are delegated to the process (entering its
    /// exclusive section). Thread- and function-scoped resources are sourced
    /// here; `work_unit` selects which function's container is meant.
    pub fn ensure_loaded(
        &mut self,
        work_unit: Option<WorkUnitId>,
        index: ResourceIndex,
        continuation: C,
    ) -> Proceed<C> {
        let Some(key) = self.key_for(work_unit, index) else {
            return self
                .process
                .run_exclusive(|process| process.ensure_loaded(index, continuation));
        };
        if !self.prepare(key) {
            return Proceed::Proceed(continuation);
        }

        let handle = CompletionHandle::new(self.host.clone(), key);
        let dependencies = match self.containers.get(&key) {
            Some(container) if container.needs_sourcing() => {
                let wanted = container.dependencies().to_vec();
                self.gather(work_unit, &wanted)
            }
            _ => Ok(Vec::new()),
        };

        let Some(container) = self.containers.get_mut(&key) else {
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
    pub fn check_ready(
        &mut self,
        work_unit: Option<WorkUnitId>,
        index: ResourceIndex,
        continuation: C,
    ) -> Proceed<C> {
        let Some(key) = self.key_for(work_unit, index) else {
            return self
                .process
                .run_exclusive(|process| process.check_ready(index, continuation));
        };
        let handle = CompletionHandle::new(self.host.clone(), key);
        match self.containers.get_mut(&key) {
            Some(container) => container.check_ready(continuation, &handle),
            None => Proceed::Proceed(continuation),
        }
    }

    /// Returns the object of the resource at `index` as seen by `work_unit`.
    ///
    /// # Errors
    ///
    /// The container's failure, or [`ResourceError::NotLoaded`] /
    /// [`ResourceError::NotBound`] if it was never requested.
    pub fn object(&self, work_unit: Option<WorkUnitId>, index: ResourceIndex) -> Result<Object, Escalation> {
        let Some(key) = self.key_for(work_unit, index) else {
            return self.process.run_exclusive(|process| process.object(index));
        };
        match self.containers.get(&key) {
            Some(container) => container.object().cloned(),
            None if self.bindings.registry.get(index).is_none() => {
                Err(ResourceError::NotBound(index).into())
            }
            None => Err(ResourceError::NotLoaded(self.bindings.registry.name_of(index)).into()),
        }
    }

    /// Runs `f` on the container for `index` as seen by `work_unit`.
    ///
    /// Returns `None` if the container has not been created.
    pub fn with_container<R>(
        &mut self,
        work_unit: Option<WorkUnitId>,
        index: ResourceIndex,
        f: impl FnOnce(&mut ResourceContainer<C>) -> R,
    ) -> Option<R> {
        match self.key_for(work_unit, index) {
            Some(key) => self.containers.get_mut(&key).map(f),
            None => self
                .process
                .run_exclusive(|process| process.container_mut(index).map(f)),
        }
    }

    /// Returns the latch for waits owned by `work_unit`, creating it if needed.
    ///
    /// `label` names what is being waited on, for timeout errors.
    pub fn work_unit_latch(&mut self, work_unit: WorkUnitId, label: &str) -> &mut ResourceLatch<C> {
        &mut self
            .latches
            .entry(work_unit)
            .or_insert_with(|| (label.to_owned(), ResourceLatch::new()))
            .1
    }

    /// Returns the latch for `work_unit` if one exists.
    pub fn existing_work_unit_latch(&mut self, work_unit: WorkUnitId) -> Option<&mut ResourceLatch<C>> {
        self.latches.get_mut(&work_unit).map(|(_, latch)| latch)
    }

    /// Removes the latch for `work_unit`.
    pub fn remove_work_unit_latch(&mut self, work_unit: WorkUnitId) -> Option<ResourceLatch<C>> {
        self.latches.remove(&work_unit).map(|(_, latch)| latch)
    }

    /// Hands continuations to the resumer once this exclusive section ends.
    pub fn resume(&mut self, resumed: impl IntoIterator<Item = Resumed<C>>) {
        self.resumed.extend(resumed);
    }

    /// Returns storage for higher-layer per-thread state.
    #[must_use]
    pub fn locals(&self) -> &ScopeLocals {
        &self.locals
    }

    /// Returns storage for higher-layer per-thread state, mutably.
    pub fn locals_mut(&mut self) -> &mut ScopeLocals {
        &mut self.locals
    }

    /// Returns the indices of the containers created for `work_unit` and the
    /// thread, that are ready, in resolution order.
    #[must_use]
    pub fn loaded(&self, work_unit: Option<WorkUnitId>) -> Vec<ResourceIndex> {
        self.bindings
            .order
            .iter()
            .copied()
            .filter(|&index| {
                self.key_for(work_unit, index)
                    .and_then(|key| self.containers.get(&key))
                    .is_some_and(ResourceContainer::is_ready)
            })
            .collect()
    }

    /// Releases the function-scoped containers of `work_unit`, dependents first.
    pub fn unload_work_unit(&mut self, work_unit: WorkUnitId, cause: ReleaseCause) {
        let order: Vec<ResourceIndex> = self
            .bindings
            .unload_order()
            .filter(|index| index.scope() == ResourceScope::Function)
            .collect();
        for index in order {
            if let Some(mut container) = self
                .containers
                .remove(&ContainerKey::for_work_unit(index, work_unit))
            {
                let abandoned = container.unload(cause);
                self.resumed.extend(abandoned);
            }
        }
        if let Some((_, mut latch)) = self.latches.remove(&work_unit) {
            let abandoned = latch.fail(
                ResourceError::ShuttingDown(work_unit.to_string()).into(),
                true,
            );
            self.resumed.extend(abandoned);
        }
    }

    /// Releases every container owned by the thread, dependents first.
    ///
    /// Function-scoped containers still present (from work units that never
    /// completed) go before thread-scoped ones.
    pub fn unload(&mut self, cause: ReleaseCause) {
        let mut units: Vec<WorkUnitId> = self
            .containers
            .keys()
            .filter_map(ContainerKey::work_unit)
            .chain(self.latches.keys().copied())
            .collect();
        units.sort_unstable();
        units.dedup();
        for unit in units.into_iter().rev() {
            self.unload_work_unit(unit, cause);
        }

        let order: Vec<ResourceIndex> = self
            .bindings
            .unload_order()
            .filter(|index| index.scope() == ResourceScope::Thread)
            .collect();
        for index in order {
            if let Some(mut container) = self.containers.remove(&ContainerKey::shared(index)) {
                let abandoned = container.unload(cause);
                self.resumed.extend(abandoned);
            }
        }
        tracing::trace!(thread = %self.id, ?cause, "thread containers unloaded");
    }

    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration) {
        for container in self.containers.values_mut() {
            let resumed = container.expire(now, timeout);
            self.resumed.extend(resumed);
        }
        for (unit, (label, latch)) in &mut self.latches {
            let name = format!("{label} ({unit})");
            let resumed = latch.expire(now, timeout, || {
                ResourceError::Timeout { name, timeout }.into()
            });
            self.resumed.extend(resumed);
        }
    }

    pub(crate) fn abandon(&mut self) {
        for container in self.containers.values_mut() {
            let resumed = container.abandon();
            self.resumed.extend(resumed);
        }
        for (unit, (_, latch)) in &mut self.latches {
            let resumed = latch.fail(ResourceError::ShuttingDown(unit.to_string()).into(), true);
            self.resumed.extend(resumed);
        }
    }

    /// Maps `index` to a local container key, or `None` for process scope.
    fn key_for(&self, work_unit: Option<WorkUnitId>, index: ResourceIndex) -> Option<ContainerKey> {
        match (index.scope(), work_unit) {
            (ResourceScope::Process, _) => None,
            (ResourceScope::Function, Some(unit)) => Some(ContainerKey::for_work_unit(index, unit)),
            _ => Some(ContainerKey::shared(index)),
        }
    }

    fn prepare(&mut self, key: ContainerKey) -> bool {
        if self.containers.contains_key(&key) {
            return true;
        }
        match self.bindings.container(key) {
            Ok(mut container) => {
                if self.process.is_abandoned() {
                    self.resumed.extend(container.abandon());
                }
                self.containers.insert(key, container);
                true
            }
            Err(error) => {
                tracing::warn!(?key, %error, "cannot create thread container");
                false
            }
        }
    }

    fn gather(
        &self,
        work_unit: Option<WorkUnitId>,
        dependencies: &[ResourceIndex],
    ) -> Result<Vec<(ResourceIndex, Object)>, Escalation> {
        dependencies
            .iter()
            .map(|&dependency| Ok((dependency, self.object(work_unit, dependency)?)))
            .collect()
    }

    fn apply(&mut self, key: ContainerKey, event: SourceEvent) {
        match self.containers.get_mut(&key) {
            Some(container) => {
                let resumed = event.apply(container);
                self.resumed.extend(resumed);
            }
            None => tracing::debug!(?key, "event for unknown thread container ignored"),
        }
    }
}

/// One thread of execution within a process.
///
/// Everything that touches the thread's scope is serialized: function steps,
/// source completions and timeouts all run through
/// [`run_exclusive`](Self::run_exclusive) or [`submit`](Self::submit).
pub struct ThreadState<C: Send + 'static> {
    id: ThreadStateId,
    process: Arc<ProcessState<C>>,
    exclusive: Exclusive<ThreadScope<C>>,
}

impl<C: Send + 'static> ThreadState<C> {
    pub(crate) fn new(
        id: u64,
        process: Arc<ProcessState<C>>,
        bindings: Arc<Bindings>,
        resumer: Arc<dyn Resumer<C>>,
    ) -> Arc<Self> {
        let id = ThreadStateId(id);
        Arc::new_cyclic(|this: &Weak<Self>| {
            let host: Weak<dyn ContainerHost> = this.clone();
            let scope = ThreadScope {
                id,
                process: Arc::clone(&process),
                bindings,
                host,
                containers: HashMap::new(),
                latches: HashMap::new(),
                resumed: Vec::new(),
                locals: ScopeLocals::new(),
            };
            tracing::trace!(process = %process.id(), thread = %id, "thread created");

            Self {
                id,
                process,
                exclusive: Exclusive::new(scope, dispatcher(resumer)),
            }
        })
    }

    /// Returns the thread identifier.
    #[must_use]
    pub fn id(&self) -> ThreadStateId {
        self.id
    }

    /// Returns the owning process.
    #[must_use]
    pub fn process(&self) -> &Arc<ProcessState<C>> {
        &self.process
    }

    /// Runs `op` with exclusive access to the thread scope.
    ///
    /// Must not be called from inside this thread's own exclusive section.
    pub fn run_exclusive<R>(&self, op: impl FnOnce(&mut ThreadScope<C>) -> R) -> R {
        self.exclusive.run(op)
    }

    /// Queues `message` to run with exclusive access to the thread scope.
    ///
    /// Safe to call from anywhere, including from inside this thread's own
    /// exclusive section (the message runs before the section ends).
    pub fn submit(&self, message: impl FnOnce(&mut ThreadScope<C>) + Send + 'static) {
        self.exclusive.submit(message);
    }
}

impl<C: Send + 'static> ContainerHost for ThreadState<C> {
    fn post(&self, key: ContainerKey, event: SourceEvent) {
        self.submit(move |scope| scope.apply(key, event));
    }
}

impl<C: Send + 'static> fmt::Debug for ThreadState<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", self.process.id())
            .finish_non_exhaustive()
    }
}
