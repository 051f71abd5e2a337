//! Per-instance resource lifecycle.
//!
//! A [`ResourceContainer`] owns one resource's state inside one execution
//! context: whether it has been sourced, the object once it has, and the
//! continuations waiting on it.
//!
//! ```text
//! UNSOURCED ──ensure_loaded──▶ SOURCING ──complete──▶ READY
//!     │                           │
//!     └──────── error ────────────┴──── fail ───────▶ FAILED (sticky)
//! ```
//!
//! Two latches hold waiters: the *load* latch while sourcing is pending, and
//! the *ready* latch while a loaded object reports itself not ready. Every
//! method that lets continuations go returns them as [`Resumed`] values; the
//! owning context dispatches them after leaving its exclusive section.

use core::any::{Any, TypeId};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::context::ContainerKey;
use crate::error::{Escalation, ResourceError};
use crate::latch::{ResourceLatch, Resumed};
use crate::resource::{BoundResource, GovernanceIndex, Object, ResourceIndex, ResourceInstance};
use crate::source::{CompletionHandle, ReleaseCause, SourceContext, Sourced};

/// Lifecycle state of a [`ResourceContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Sourcing has not been requested.
    Unsourced,
    /// Sourcing was requested and has not completed.
    Sourcing,
    /// The object is available.
    Ready,
    /// Sourcing failed. Never leaves this state.
    Failed,
}

/// Whether a continuation may carry on immediately.
#[derive(Debug)]
pub enum Proceed<C> {
    /// Carry on; the continuation is handed back.
    Proceed(C),
    /// The continuation is waiting on a latch and will be resumed later.
    Suspended,
}

impl<C> Proceed<C> {
    /// Returns the continuation if it may carry on.
    pub fn into_continuation(self) -> Option<C> {
        match self {
            Proceed::Proceed(continuation) => Some(continuation),
            Proceed::Suspended => None,
        }
    }
}

/// One resource, sourced at most once, inside one execution context.
pub struct ResourceContainer<C> {
    name: String,
    key: ContainerKey,
    instance: Option<ResourceInstance>,
    input_bound: bool,
    state: ContainerState,
    object: Option<Object>,
    failure: Option<Escalation>,
    load_latch: ResourceLatch<C>,
    ready_latch: ResourceLatch<C>,
    extensions: HashMap<TypeId, Option<Box<dyn Any + Send + Sync>>>,
    unloaded: bool,
}

impl<C> ResourceContainer<C> {
    /// Creates a container for `bound`, using the instance at `instance`.
    ///
    /// For input-bound resources `input` is the caller-supplied object; the
    /// container starts [`ContainerState::Ready`] when it is present.
    #[must_use]
    pub fn new(
        bound: &BoundResource,
        instance: usize,
        input: Option<Object>,
        key: ContainerKey,
    ) -> Self {
        let instance = bound
            .instance(instance)
            .or_else(|| bound.instance(bound.default_instance()))
            .cloned();
        let ready = bound.is_input_bound() && input.is_some();

        Self {
            name: bound.name().to_owned(),
            key,
            instance,
            input_bound: bound.is_input_bound(),
            state: if ready {
                ContainerState::Ready
            } else {
                ContainerState::Unsourced
            },
            object: if ready { input } else { None },
            failure: None,
            load_latch: ResourceLatch::new(),
            ready_latch: ResourceLatch::new(),
            extensions: HashMap::new(),
            unloaded: false,
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resource index.
    #[must_use]
    pub fn index(&self) -> ResourceIndex {
        self.key.index()
    }

    /// Returns the key identifying this container in its context.
    #[must_use]
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Returns `true` once the object is available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ContainerState::Ready
    }

    /// Returns `true` if sourcing has not been requested yet.
    #[must_use]
    pub fn needs_sourcing(&self) -> bool {
        self.state == ContainerState::Unsourced
    }

    /// Returns the failure, if sourcing failed.
    #[must_use]
    pub fn failure(&self) -> Option<&Escalation> {
        self.failure.as_ref()
    }

    /// Returns the dependencies of the selected instance.
    #[must_use]
    pub fn dependencies(&self) -> &[ResourceIndex] {
        match &self.instance {
            Some(instance) => instance.dependencies(),
            None => &[],
        }
    }

    /// Returns the governances overseeing the selected instance.
    #[must_use]
    pub fn governance(&self) -> &[GovernanceIndex] {
        match &self.instance {
            Some(instance) => instance.governance(),
            None => &[],
        }
    }

    /// Returns the number of continuations waiting on this container.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.load_latch.waiting_count() + self.ready_latch.waiting_count()
    }

    /// Makes sure sourcing has been requested.
    ///
    /// Sources the object on first call, using `dependencies` (the objects of
    /// the selected instance's dependencies) and `handle` for asynchronous
    /// completion. Returns [`Proceed::Proceed`] when the container is ready
    /// *or failed*: callers inspect [`failure`](Self::failure) to tell which.
    /// Returns [`Proceed::Suspended`] when the continuation now waits on the
    /// load latch.
    pub fn ensure_loaded(
        &mut self,
        continuation: C,
        dependencies: &[(ResourceIndex, Object)],
        handle: &CompletionHandle,
    ) -> Proceed<C> {
        match self.state {
            ContainerState::Ready | ContainerState::Failed => Proceed::Proceed(continuation),
            ContainerState::Sourcing => self.wait_for_load(continuation),
            ContainerState::Unsourced => {
                if self.input_bound {
                    self.fail_load(ResourceError::InputMissing(self.name.clone()).into());
                    return Proceed::Proceed(continuation);
                }
                let Some(instance) = self.instance.clone() else {
                    self.fail_load(ResourceError::NotBound(self.key.index()).into());
                    return Proceed::Proceed(continuation);
                };

                self.state = ContainerState::Sourcing;
                tracing::trace!(resource = %self.name, "sourcing resource");

                let ctx = SourceContext::new(&self.name, self.key.index(), dependencies, handle);
                match instance.source().source(&ctx) {
                    Ok(Sourced::Ready(object)) => {
                        self.complete(object);
                        Proceed::Proceed(continuation)
                    }
                    Ok(Sourced::Pending) => self.wait_for_load(continuation),
                    Err(cause) => {
                        self.fail_load(cause);
                        Proceed::Proceed(continuation)
                    }
                }
            }
        }
    }

    /// Fails the container because a dependency failed.
    pub fn fail_dependency(&mut self, cause: Escalation) -> Vec<Resumed<C>> {
        self.fail_load(cause)
    }

    /// Checks that the loaded object is usable right now.
    ///
    /// Returns [`Proceed::Proceed`] when ready, when failed, or when not yet
    /// loaded (readiness only applies to a loaded object). Otherwise the
    /// continuation waits on the ready latch until
    /// [`notify_ready`](Self::notify_ready).
    pub fn check_ready(&mut self, continuation: C, handle: &CompletionHandle) -> Proceed<C> {
        let (Some(object), Some(instance)) = (&self.object, &self.instance) else {
            return Proceed::Proceed(continuation);
        };
        if self.state != ContainerState::Ready {
            return Proceed::Proceed(continuation);
        }

        let ctx = SourceContext::new(&self.name, self.key.index(), &[], handle);
        if instance.source().is_ready(object, &ctx) {
            return Proceed::Proceed(continuation);
        }

        tracing::trace!(resource = %self.name, "resource not ready; suspending");
        match self.ready_latch.register(continuation) {
            Some(resumed) => Proceed::Proceed(resumed.continuation),
            None => Proceed::Suspended,
        }
    }

    /// Records the sourced object and releases every load waiter.
    ///
    /// Ignored unless sourcing is in progress.
    pub fn complete(&mut self, object: Object) -> Vec<Resumed<C>> {
        if self.state != ContainerState::Sourcing {
            tracing::warn!(resource = %self.name, state = ?self.state, "late completion ignored");
            return Vec::new();
        }
        tracing::trace!(resource = %self.name, "resource ready");
        self.state = ContainerState::Ready;
        self.object = Some(object);
        self.load_latch.release(true)
    }

    /// Fails sourcing permanently and fails every load waiter.
    ///
    /// Ignored once the container is ready or already failed.
    pub fn fail_load(&mut self, cause: Escalation) -> Vec<Resumed<C>> {
        if matches!(self.state, ContainerState::Ready | ContainerState::Failed) {
            tracing::warn!(resource = %self.name, state = ?self.state, "late failure ignored");
            return Vec::new();
        }
        tracing::debug!(resource = %self.name, error = %cause, "resource failed");
        self.state = ContainerState::Failed;
        self.failure = Some(cause.clone());
        let mut resumed = self.load_latch.fail(cause.clone(), true);
        resumed.extend(self.ready_latch.fail(cause, true));
        resumed
    }

    /// Lets readiness waiters re-check the object.
    ///
    /// The release is not permanent: each resumed continuation asks the
    /// source again and may wait once more.
    pub fn notify_ready(&mut self) -> Vec<Resumed<C>> {
        self.ready_latch.release(false)
    }

    /// Fails the container because the object will never become ready.
    pub fn notify_ready_failed(&mut self, cause: Escalation) -> Vec<Resumed<C>> {
        if self.state == ContainerState::Failed {
            return Vec::new();
        }
        tracing::debug!(resource = %self.name, error = %cause, "resource will never be ready");
        self.state = ContainerState::Failed;
        self.failure = Some(cause.clone());
        let mut resumed = self.ready_latch.fail(cause.clone(), true);
        resumed.extend(self.load_latch.fail(cause, true));
        resumed
    }

    /// Fails any waiter registered longer than `timeout` before `now`.
    ///
    /// A load timeout fails the container; a readiness timeout fails the
    /// container as well, since the object can no longer be trusted.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<Resumed<C>> {
        let name = self.name.clone();
        let timed_out = move || {
            Escalation::new(ResourceError::Timeout {
                name: name.clone(),
                timeout,
            })
        };

        let stale = |latch: &ResourceLatch<C>| {
            latch
                .oldest_registration()
                .is_some_and(|at| now.saturating_duration_since(at) > timeout)
        };

        if stale(&self.load_latch) {
            tracing::warn!(resource = %self.name, ?timeout, "resource sourcing timed out");
            self.fail_load(timed_out())
        } else if stale(&self.ready_latch) {
            tracing::warn!(resource = %self.name, ?timeout, "resource readiness timed out");
            self.notify_ready_failed(timed_out())
        } else {
            Vec::new()
        }
    }

    /// Fails every waiter because the owning context is shutting down.
    pub fn abandon(&mut self) -> Vec<Resumed<C>> {
        let cause = Escalation::new(ResourceError::ShuttingDown(self.name.clone()));
        match self.state {
            ContainerState::Unsourced | ContainerState::Sourcing => self.fail_load(cause),
            ContainerState::Ready => self.notify_ready_failed(cause),
            ContainerState::Failed => Vec::new(),
        }
    }

    /// Returns the object, or why it is unavailable.
    ///
    /// # Errors
    ///
    /// - the sourcing failure if the container failed
    /// - [`ResourceError::NotLoaded`] if sourcing has not completed
    pub fn object(&self) -> Result<&Object, Escalation> {
        match (&self.object, &self.failure) {
            (_, Some(failure)) => Err(failure.clone()),
            (Some(object), None) if self.state == ContainerState::Ready => Ok(object),
            _ => Err(ResourceError::NotLoaded(self.name.clone()).into()),
        }
    }

    /// Returns the object downcast to `T`.
    ///
    /// # Errors
    ///
    /// As [`object`](Self::object), plus [`ResourceError::TypeMismatch`].
    pub fn object_as<T: Any>(&self) -> Result<&T, Escalation> {
        self.object()?.downcast_ref::<T>().ok_or_else(|| {
            ResourceError::TypeMismatch {
                name: self.name.clone(),
                expected: core::any::type_name::<T>(),
            }
            .into()
        })
    }

    /// Extracts a typed view of the object, caching the result.
    ///
    /// Never triggers sourcing: returns `None` unless the container is ready.
    /// The extractor runs at most once per extension type for this container.
    pub fn extract_extension<E, F>(&mut self, extractor: F) -> Option<E>
    where
        E: Clone + Send + Sync + 'static,
        F: FnOnce(&Object) -> Option<E>,
    {
        if self.state != ContainerState::Ready {
            return None;
        }
        let object = self.object.as_ref()?;
        let cached = self
            .extensions
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                extractor(object).map(|extension| Box::new(extension) as Box<dyn Any + Send + Sync>)
            });
        cached
            .as_ref()
            .and_then(|extension| extension.downcast_ref::<E>())
            .cloned()
    }

    /// Releases the object through its source.
    ///
    /// Runs at most once. Waiters still registered are abandoned first and
    /// returned.
    pub fn unload(&mut self, cause: ReleaseCause) -> Vec<Resumed<C>> {
        if self.unloaded {
            return Vec::new();
        }
        let abandoned = if self.waiting_count() > 0 {
            tracing::warn!(resource = %self.name, waiting = self.waiting_count(), "unloading with waiters");
            self.abandon()
        } else {
            Vec::new()
        };

        self.unloaded = true;
        if let Some(instance) = &self.instance {
            tracing::trace!(resource = %self.name, ?cause, "releasing resource");
            instance.source().release(self.object.as_ref(), cause);
        }
        abandoned
    }

    fn wait_for_load(&mut self, continuation: C) -> Proceed<C> {
        match self.load_latch.register(continuation) {
            Some(resumed) => Proceed::Proceed(resumed.continuation),
            None => Proceed::Suspended,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::resource::{ResourceBinding, ResourceRegistry, ResourceScope};
    use crate::source::{ResourceSource, source_fn};

    fn container_for(binding: ResourceBinding) -> (ResourceContainer<&'static str>, CompletionHandle) {
        let mut registry = ResourceRegistry::new();
        let index = registry.bind(binding).unwrap();
        let bound = registry.get(index).unwrap();
        let key = ContainerKey::shared(index);
        (
            ResourceContainer::new(bound, bound.default_instance(), None, key),
            CompletionHandle::detached(key),
        )
    }

    fn binding(source: impl ResourceSource) -> ResourceBinding {
        ResourceBinding::new("db", ResourceScope::Process).with_instance(ResourceInstance::new(source))
    }

    struct Counting {
        sourced: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        ready: bool,
    }

    impl ResourceSource for Counting {
        fn source(&self, _ctx: &SourceContext<'_>) -> Result<Sourced, Escalation> {
            self.sourced.fetch_add(1, Ordering::SeqCst);
            Ok(Sourced::Pending)
        }

        fn is_ready(&self, _object: &Object, _ctx: &SourceContext<'_>) -> bool {
            self.ready
        }

        fn release(&self, _object: Option<&Object>, _cause: ReleaseCause) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting(ready: bool) -> (Counting, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let sourced = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                sourced: Arc::clone(&sourced),
                released: Arc::clone(&released),
                ready,
            },
            sourced,
            released,
        )
    }

    #[test]
    fn immediate_source_proceeds() {
        let (mut container, handle) = container_for(binding(source_fn(|_| Ok(Sourced::ready(5_u32)))));

        assert!(matches!(
            container.ensure_loaded("f", &[], &handle),
            Proceed::Proceed("f")
        ));
        assert_eq!(container.state(), ContainerState::Ready);
        assert_eq!(container.object_as::<u32>().unwrap(), &5);
    }

    #[test]
    fn pending_source_is_requested_once_and_releases_all_waiters() {
        let (source, sourced, _) = counting(true);
        let (mut container, handle) = container_for(binding(source));

        assert!(matches!(container.ensure_loaded("a", &[], &handle), Proceed::Suspended));
        assert!(matches!(container.ensure_loaded("b", &[], &handle), Proceed::Suspended));
        assert_eq!(sourced.load(Ordering::SeqCst), 1);

        let resumed = container.complete(crate::resource::object("conn"));
        let order: Vec<_> = resumed.iter().map(|r| r.continuation).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert!(container.is_ready());
    }

    #[test]
    fn failure_is_sticky_and_shared() {
        let (source, _, _) = counting(true);
        let (mut container, handle) = container_for(binding(source));
        container.ensure_loaded("a", &[], &handle);

        let cause = Escalation::msg("refused");
        let resumed = container.fail_load(cause.clone());
        assert_eq!(resumed.len(), 1);
        assert!(resumed[0].outcome.failure().is_some_and(|c| c.ptr_eq(&cause)));

        // A later completion does not revive it.
        assert!(container.complete(crate::resource::object(1_u8)).is_empty());
        assert_eq!(container.state(), ContainerState::Failed);
        assert!(container.object().unwrap_err().ptr_eq(&cause));

        // New callers proceed and observe the failure.
        assert!(matches!(container.ensure_loaded("late", &[], &handle), Proceed::Proceed("late")));
    }

    /// Counts warnings emitted while it is the default subscriber.
    #[derive(Clone, Default)]
    struct Warnings(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Warnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn late_completions_are_ignored_with_a_warning() {
        use tracing_subscriber::layer::SubscriberExt;

        let warnings = Warnings::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());
        tracing::subscriber::with_default(subscriber, || {
            let (source, _, _) = counting(true);
            let (mut container, handle) = container_for(binding(source));
            container.ensure_loaded("a", &[], &handle);
            assert_eq!(container.complete(crate::resource::object("conn")).len(), 1);
            assert_eq!(warnings.0.load(Ordering::SeqCst), 0);

            assert!(container.complete(crate::resource::object("again")).is_empty());
            assert!(container.fail_load(Escalation::msg("too late")).is_empty());
            assert_eq!(container.object_as::<&str>().unwrap(), &"conn");
        });
        assert_eq!(warnings.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn source_error_fails_immediately() {
        let (mut container, handle) =
            container_for(binding(source_fn(|_| Err(Escalation::msg("no route")))));

        assert!(matches!(container.ensure_loaded("f", &[], &handle), Proceed::Proceed(_)));
        assert_eq!(container.failure().map(ToString::to_string), Some("no route".into()));
    }

    #[test]
    fn unready_object_waits_for_notification() {
        let (source, _, _) = counting(false);
        let (mut container, handle) = container_for(binding(source));
        container.ensure_loaded("f", &[], &handle);
        container.complete(crate::resource::object(()));

        assert!(matches!(container.check_ready("f", &handle), Proceed::Suspended));
        let resumed = container.notify_ready();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].continuation, "f");
    }

    #[test]
    fn missing_input_fails_with_input_missing() {
        let (mut container, handle) =
            container_for(ResourceBinding::new("request", ResourceScope::Process).input());

        container.ensure_loaded("f", &[], &handle);
        let failure = container.failure().unwrap();
        assert!(matches!(
            failure.downcast_ref::<ResourceError>(),
            Some(ResourceError::InputMissing(name)) if name == "request"
        ));
    }

    #[test]
    fn extension_is_cached_and_never_loads() {
        let (mut container, handle) = container_for(binding(source_fn(|_| Ok(Sourced::ready(7_i64)))));
        let calls = AtomicUsize::new(0);

        let extract = |object: &Object| {
            calls.fetch_add(1, Ordering::SeqCst);
            object.downcast_ref::<i64>().map(|v| v * 2)
        };
        assert_eq!(container.extract_extension(extract), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        container.ensure_loaded("f", &[], &handle);
        assert_eq!(container.extract_extension(extract), Some(14));
        assert_eq!(container.extract_extension(extract), Some(14));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_fails_stale_waiters() {
        let (source, _, _) = counting(true);
        let (mut container, handle) = container_for(binding(source));
        container.ensure_loaded("f", &[], &handle);

        let timeout = Duration::from_millis(10);
        let resumed = container.expire(Instant::now() + Duration::from_secs(1), timeout);
        assert_eq!(resumed.len(), 1);
        assert!(matches!(
            resumed[0].outcome.failure().and_then(|c| c.downcast_ref::<ResourceError>()),
            Some(ResourceError::Timeout { .. })
        ));
        assert_eq!(container.state(), ContainerState::Failed);
    }

    #[test]
    fn unload_releases_exactly_once() {
        let (source, _, released) = counting(true);
        let (mut container, handle) = container_for(binding(source));
        container.ensure_loaded("f", &[], &handle);
        container.complete(crate::resource::object(()));

        container.unload(ReleaseCause::Completed);
        container.unload(ReleaseCause::Completed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
