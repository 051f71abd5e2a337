//! Execution contexts.
//!
//! Work runs inside two nested contexts:
//!
//! - [`ProcessState`] - one per invocation, owning process-scoped containers
//! - [`ThreadState`] - one per thread of execution in a process, owning
//!   thread- and function-scoped containers
//!
//! Each context guards its mutable part (its *scope*) with an [`Exclusive`]:
//! operations run one at a time through `run_exclusive`, and anything that
//! arrives from elsewhere (a source completing, a timeout) is posted as a
//! message with `submit`.
//!
//! # Lock order
//!
//! A thread may enter its process's exclusive section while holding its own.
//! The reverse never happens: a process only ever *submits* to a thread. This
//! keeps the two levels deadlock-free.
//!
//! Continuations let go by latches are collected inside the scope and handed
//! to the context's [`Resumer`] after the exclusive section ends.

mod exclusive;
mod process;
mod thread;

pub use exclusive::*;
pub use process::*;
pub use thread::*;

use core::any::{Any, TypeId};
use core::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::container::ResourceContainer;
use crate::error::{Escalation, ResourceError};
use crate::latch::Resumed;
use crate::resource::{Object, ResourceIndex, ResourceRegistry};

/// Identifies one function invocation (and the duties that run with it).
///
/// Function-scoped containers are keyed by the work unit they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkUnitId(pub u64);

impl fmt::Display for WorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit_{}", self.0)
    }
}

/// Identifies a container within its execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerKey {
    index: ResourceIndex,
    work_unit: Option<WorkUnitId>,
}

impl ContainerKey {
    /// Key for a process- or thread-scoped container.
    #[must_use]
    pub const fn shared(index: ResourceIndex) -> Self {
        Self {
            index,
            work_unit: None,
        }
    }

    /// Key for a function-scoped container owned by `work_unit`.
    #[must_use]
    pub const fn for_work_unit(index: ResourceIndex, work_unit: WorkUnitId) -> Self {
        Self {
            index,
            work_unit: Some(work_unit),
        }
    }

    /// Returns the resource index.
    #[must_use]
    pub const fn index(&self) -> ResourceIndex {
        self.index
    }

    /// Returns the owning work unit, for function-scoped containers.
    #[must_use]
    pub const fn work_unit(&self) -> Option<WorkUnitId> {
        self.work_unit
    }
}

/// Events a [`CompletionHandle`](crate::source::CompletionHandle) posts to its container.
pub(crate) enum SourceEvent {
    Loaded(Object),
    LoadFailed(Escalation),
    Ready,
    ReadyFailed(Escalation),
}

impl SourceEvent {
    pub(crate) fn apply<C>(self, container: &mut ResourceContainer<C>) -> Vec<Resumed<C>> {
        match self {
            SourceEvent::Loaded(object) => container.complete(object),
            SourceEvent::LoadFailed(cause) => container.fail_load(cause),
            SourceEvent::Ready => container.notify_ready(),
            SourceEvent::ReadyFailed(cause) => container.notify_ready_failed(cause),
        }
    }
}

/// An execution context that accepts completion events for its containers.
pub(crate) trait ContainerHost: Send + Sync {
    fn post(&self, key: ContainerKey, event: SourceEvent);
}

/// Receives continuations let go by latches.
///
/// Called outside any exclusive section. Implementations typically schedule
/// the continuation on a worker.
pub trait Resumer<C>: Send + Sync + 'static {
    /// Takes ownership of a resumed continuation.
    fn resume(&self, resumed: Resumed<C>);
}

impl<C, F> Resumer<C> for F
where
    F: Fn(Resumed<C>) + Send + Sync + 'static,
{
    fn resume(&self, resumed: Resumed<C>) {
        self(resumed);
    }
}

/// An execution context the asset manager can police.
pub trait AssetHost: Send + Sync {
    /// Fails every latch waiter registered longer than `timeout` before `now`.
    fn check_timeouts(&self, now: Instant, timeout: Duration);

    /// Fails every waiter because the system is shutting down.
    fn abandon(&self);

    /// Returns `true` once the context has ended.
    fn is_finished(&self) -> bool;
}

/// Typed per-scope storage for higher layers.
///
/// Holds at most one value per type. Layer 2 keeps its per-thread and
/// per-process bookkeeping here so it is mutated under the same exclusive
/// access as the containers.
#[derive(Default)]
pub struct ScopeLocals {
    values: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl ScopeLocals {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the one it replaced.
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// Returns the value of type `T`.
    #[must_use]
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }

    /// Returns the value of type `T` mutably.
    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.values.get_mut(&TypeId::of::<T>())?.downcast_mut::<T>()
    }

    /// Returns the value of type `T`, inserting its default first if absent.
    pub fn get_or_default<T: Any + Send + Default>(&mut self) -> &mut T {
        self.values
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()) as Box<dyn Any + Send>)
            .downcast_mut::<T>()
            .expect("values are keyed by their TypeId")
    }

    /// Removes and returns the value of type `T`.
    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok().map(|boxed| *boxed))
    }
}

/// Resource configuration shared by a process and its threads.
pub(crate) struct Bindings {
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) order: Arc<[ResourceIndex]>,
    pub(crate) inputs: HashMap<ResourceIndex, Object>,
    pub(crate) instances: HashMap<ResourceIndex, usize>,
}

impl Bindings {
    /// Creates the container for `key` with the process's instance selection.
    pub(crate) fn container<C>(&self, key: ContainerKey) -> Result<ResourceContainer<C>, ResourceError> {
        let index = key.index();
        let bound = self
            .registry
            .get(index)
            .ok_or(ResourceError::NotBound(index))?;
        let instance = self
            .instances
            .get(&index)
            .copied()
            .unwrap_or_else(|| bound.default_instance());
        Ok(ResourceContainer::new(
            bound,
            instance,
            self.inputs.get(&index).cloned(),
            key,
        ))
    }

    /// Returns the unload order: the reverse of resolution order.
    pub(crate) fn unload_order(&self) -> impl Iterator<Item = ResourceIndex> + '_ {
        self.order.iter().rev().copied()
    }
}
