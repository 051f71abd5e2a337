//! The contract resource providers implement.
//!
//! A [`ResourceSource`] is asked to produce its object once per container.
//! It may answer straight away with [`Sourced::Ready`], or return
//! [`Sourced::Pending`] and finish later from any thread through the
//! [`CompletionHandle`] found on the [`SourceContext`].
//!
//! Completions are posted to the owning execution context as messages, so
//! they are safe to send at any time, including from inside `source` itself.
//!
//! # Example
//!
//! ```
//! use keel_system::source::{source_fn, Sourced};
//!
//! let pool = source_fn(|ctx| {
//!     let handle = ctx.completion();
//!     std::thread::spawn(move || handle.complete_with(String::from("connected")));
//!     Ok(Sourced::Pending)
//! });
//! ```

use core::any::Any;
use core::fmt;
use std::sync::Weak;

use crate::context::{ContainerHost, ContainerKey, SourceEvent};
use crate::error::Escalation;
use crate::resource::{Object, ResourceIndex};

/// What a source produced on request.
pub enum Sourced {
    /// The object is available now.
    Ready(Object),
    /// The object will arrive through the [`CompletionHandle`].
    Pending,
}

impl Sourced {
    /// Wraps a value as a ready object.
    pub fn ready<T: Send + Sync + 'static>(value: T) -> Self {
        Sourced::Ready(crate::resource::object(value))
    }
}

impl fmt::Debug for Sourced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sourced::Ready(_) => write!(f, "Ready"),
            Sourced::Pending => write!(f, "Pending"),
        }
    }
}

/// Why a container is releasing its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// The owning scope completed normally.
    Completed,
    /// The owning scope ended because of an escalation.
    Escalated,
    /// The execution context was shut down.
    Shutdown,
}

/// Provides the object for a resource.
///
/// Implementations must be cheap to call from inside an execution context's
/// exclusive section. Slow work should return [`Sourced::Pending`] and finish
/// elsewhere.
pub trait ResourceSource: Send + Sync + 'static {
    /// Produces the object, or promises it later.
    ///
    /// # Errors
    ///
    /// Returning an escalation fails the container permanently; every waiter
    /// receives the same failure.
    fn source(&self, ctx: &SourceContext<'_>) -> Result<Sourced, Escalation>;

    /// Returns `true` if `object` can be used right now.
    ///
    /// Returning `false` suspends the asking function until
    /// [`CompletionHandle::notify_ready`] is called.
    fn is_ready(&self, _object: &Object, _ctx: &SourceContext<'_>) -> bool {
        true
    }

    /// Releases the object when its scope ends.
    ///
    /// `object` is `None` if sourcing never completed.
    fn release(&self, _object: Option<&Object>, _cause: ReleaseCause) {}
}

/// What a source sees while producing its object.
pub struct SourceContext<'a> {
    name: &'a str,
    index: ResourceIndex,
    dependencies: &'a [(ResourceIndex, Object)],
    handle: &'a CompletionHandle,
}

impl<'a> SourceContext<'a> {
    pub(crate) fn new(
        name: &'a str,
        index: ResourceIndex,
        dependencies: &'a [(ResourceIndex, Object)],
        handle: &'a CompletionHandle,
    ) -> Self {
        Self {
            name,
            index,
            dependencies,
            handle,
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Returns the resource index.
    #[must_use]
    pub fn index(&self) -> ResourceIndex {
        self.index
    }

    /// Returns the loaded object of a declared dependency.
    #[must_use]
    pub fn dependency(&self, index: ResourceIndex) -> Option<&Object> {
        self.dependencies
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, object)| object)
    }

    /// Returns a declared dependency downcast to `T`.
    #[must_use]
    pub fn dependency_as<T: Any>(&self, index: ResourceIndex) -> Option<&T> {
        self.dependency(index)?.downcast_ref::<T>()
    }

    /// Returns a handle for finishing asynchronously.
    #[must_use]
    pub fn completion(&self) -> CompletionHandle {
        self.handle.clone()
    }
}

/// Finishes an asynchronous sourcing or readiness wait.
///
/// Handles can be cloned and sent to any thread. Calls after the owning
/// execution context has ended, or after the container has already settled,
/// are ignored.
#[derive(Clone)]
pub struct CompletionHandle {
    host: Weak<dyn ContainerHost>,
    key: ContainerKey,
}

impl CompletionHandle {
    pub(crate) fn new(host: Weak<dyn ContainerHost>, key: ContainerKey) -> Self {
        Self { host, key }
    }

    /// Creates a handle attached to no execution context.
    ///
    /// Every call on it is ignored. Useful for driving a
    /// [`ResourceContainer`](crate::container::ResourceContainer) directly.
    #[must_use]
    pub fn detached(key: ContainerKey) -> Self {
        let host: Weak<dyn ContainerHost> = Weak::<Detached>::new();
        Self { host, key }
    }

    /// Returns the container this handle completes.
    #[must_use]
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    /// Supplies the sourced object.
    pub fn complete(&self, object: Object) {
        self.post(SourceEvent::Loaded(object));
    }

    /// Supplies the sourced object from a plain value.
    pub fn complete_with<T: Send + Sync + 'static>(&self, value: T) {
        self.complete(crate::resource::object(value));
    }

    /// Reports that sourcing failed.
    pub fn fail(&self, cause: impl Into<Escalation>) {
        self.post(SourceEvent::LoadFailed(cause.into()));
    }

    /// Reports that a previously unready object may now be ready.
    pub fn notify_ready(&self) {
        self.post(SourceEvent::Ready);
    }

    /// Reports that the object will never become ready.
    pub fn notify_failed(&self, cause: impl Into<Escalation>) {
        self.post(SourceEvent::ReadyFailed(cause.into()));
    }

    fn post(&self, event: SourceEvent) {
        match self.host.upgrade() {
            Some(host) => host.post(self.key, event),
            None => tracing::warn!(key = ?self.key, "execution context ended; completion ignored"),
        }
    }
}

struct Detached;

impl ContainerHost for Detached {
    fn post(&self, _key: ContainerKey, _event: SourceEvent) {}
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// A [`ResourceSource`] backed by a closure.
pub struct FnSource<F> {
    source: F,
}

/// Creates a source from a closure.
///
/// The closure plays the role of [`ResourceSource::source`]; readiness and
/// release keep their defaults.
pub fn source_fn<F>(source: F) -> FnSource<F>
where
    F: Fn(&SourceContext<'_>) -> Result<Sourced, Escalation> + Send + Sync + 'static,
{
    FnSource { source }
}

impl<F> ResourceSource for FnSource<F>
where
    F: Fn(&SourceContext<'_>) -> Result<Sourced, Escalation> + Send + Sync + 'static,
{
    fn source(&self, ctx: &SourceContext<'_>) -> Result<Sourced, Escalation> {
        (self.source)(ctx)
    }
}
