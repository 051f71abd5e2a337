//! Managed functions and the context their logic runs with.
//!
//! A [`ManagedFunction`] is a unit of application work. By the time it runs,
//! every resource it uses has been loaded and is ready, so its logic never
//! waits. Through its [`FunctionContext`] it can:
//!
//! - read a loaded resource ([`FunctionContext::object`])
//! - read the argument it was handed ([`FunctionContext::argument`])
//! - overwrite the argument for its next function ([`FunctionContext::set_next_argument`])
//! - instigate further flows ([`FunctionContext::do_flow`])
//! - hold its completion open for asynchronous work ([`FunctionContext::start_async`])
//!
//! # Example
//!
//! ```
//! use keel_flow::function::{FunctionContext, ManagedFunction};
//! use keel_system::error::Escalation;
//!
//! struct Greet;
//!
//! impl ManagedFunction for Greet {
//!     fn run(&self, ctx: &mut FunctionContext<'_>) -> Result<(), Escalation> {
//!         let name = ctx.argument_as::<String>().cloned().unwrap_or_default();
//!         ctx.set_next_argument(format!("hello, {name}"));
//!         Ok(())
//!     }
//! }
//! ```

use core::any::{Any, type_name};
use core::fmt;
use std::sync::{Arc, Weak};

use keel_system::context::{ProcessId, ThreadScope, ThreadState, ThreadStateId, WorkUnitId};
use keel_system::error::{Escalation, ResourceError};
use keel_system::resource::{Object, ResourceIndex, object};

use crate::engine::{Engine, book};
use crate::error::FlowError;
use crate::state::{Effects, FunctionState, PendingFlow};

/// Receives a flow's outcome: `None` if its chain completed, the escalation
/// otherwise. Returning an error escalates on the flow's instigator.
pub type FlowCallback = Box<dyn FnOnce(Option<Escalation>) -> Result<(), Escalation> + Send>;

/// Application logic run once its resources are ready.
pub trait ManagedFunction: Send + Sync + 'static {
    /// Runs the logic.
    ///
    /// # Errors
    ///
    /// The escalation is matched against the function's escalation table,
    /// then the enclosing flow, then the office's process handlers.
    fn run(&self, ctx: &mut FunctionContext<'_>) -> Result<(), Escalation>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
{
    fn run(&self, ctx: &mut FunctionContext<'_>) -> Result<(), Escalation> {
        self(ctx)
    }
}

/// How a flow is instigated.
///
/// # Example
///
/// ```
/// use keel_flow::function::FlowOptions;
///
/// let options = FlowOptions::new()
///     .spawn_thread()
///     .with_callback(|outcome| {
///         if let Some(cause) = outcome {
///             tracing::warn!(%cause, "flow failed");
///         }
///         Ok(())
///     });
/// ```
#[derive(Default)]
pub struct FlowOptions {
    spawn: bool,
    callback: Option<FlowCallback>,
}

impl FlowOptions {
    /// Runs the flow on the current thread, before the next function.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the flow on a new thread of the same process.
    #[must_use]
    pub fn spawn_thread(mut self) -> Self {
        self.spawn = true;
        self
    }

    /// Reports the flow's outcome to `callback`.
    ///
    /// An escalation the flow does not handle itself is delivered here
    /// instead of escalating further.
    #[must_use]
    pub fn with_callback(
        mut self,
        callback: impl FnOnce(Option<Escalation>) -> Result<(), Escalation> + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for FlowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOptions")
            .field("spawn", &self.spawn)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// What a function's logic sees while it runs.
pub struct FunctionContext<'a> {
    engine: &'a Engine,
    scope: &'a mut ThreadScope<FunctionState>,
    thread: &'a Arc<ThreadState<FunctionState>>,
    name: &'a str,
    unit: WorkUnitId,
    argument: Option<Object>,
    effects: Effects,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        scope: &'a mut ThreadScope<FunctionState>,
        thread: &'a Arc<ThreadState<FunctionState>>,
        name: &'a str,
        unit: WorkUnitId,
        argument: Option<Object>,
    ) -> Self {
        Self {
            engine,
            scope,
            thread,
            name,
            unit,
            argument,
            effects: Effects::default(),
        }
    }

    pub(crate) fn into_effects(self) -> Effects {
        self.effects
    }

    /// Returns the running function's name.
    #[must_use]
    pub fn function_name(&self) -> &str {
        self.name
    }

    /// Returns the process this function runs in.
    #[must_use]
    pub fn process_id(&self) -> &ProcessId {
        self.scope.process().id()
    }

    /// Returns the thread this function runs on.
    #[must_use]
    pub fn thread_id(&self) -> ThreadStateId {
        self.scope.id()
    }

    /// Returns this invocation's work unit.
    #[must_use]
    pub fn work_unit(&self) -> WorkUnitId {
        self.unit
    }

    /// Returns the object of a resource the function uses.
    ///
    /// # Errors
    ///
    /// The resource's failure, [`ResourceError::NotLoaded`] if the function
    /// did not declare it, or [`ResourceError::TypeMismatch`].
    pub fn object<T: Send + Sync + 'static>(&self, index: ResourceIndex) -> Result<Arc<T>, Escalation> {
        self.raw_object(index)?.downcast::<T>().map_err(|_| {
            ResourceError::TypeMismatch {
                name: self.scope.process().registry().name_of(index),
                expected: type_name::<T>(),
            }
            .into()
        })
    }

    /// Returns the untyped object of a resource the function uses.
    ///
    /// # Errors
    ///
    /// See [`object`](Self::object).
    pub fn raw_object(&self, index: ResourceIndex) -> Result<Object, Escalation> {
        self.scope.object(Some(self.unit), index)
    }

    /// Returns the argument handed to this function.
    #[must_use]
    pub fn argument(&self) -> Option<&Object> {
        self.argument.as_ref()
    }

    /// Returns the argument as `T`, if there is one of that type.
    #[must_use]
    pub fn argument_as<T: Any>(&self) -> Option<&T> {
        self.argument.as_ref()?.downcast_ref::<T>()
    }

    /// Takes the argument.
    pub fn take_argument(&mut self) -> Option<Object> {
        self.argument.take()
    }

    /// Sets the argument handed to the function's next function.
    pub fn set_next_argument<T: Send + Sync + 'static>(&mut self, value: T) {
        self.effects.next_argument = Some(object(value));
    }

    /// Sets an already wrapped argument for the next function.
    pub fn set_next_argument_object(&mut self, argument: Object) {
        self.effects.next_argument = Some(argument);
    }

    /// Instigates a flow starting at `function` once this function completes.
    ///
    /// # Errors
    ///
    /// [`FlowError::UnknownFunction`] if no function has that name.
    pub fn do_flow(
        &mut self,
        function: &str,
        argument: Option<Object>,
        options: FlowOptions,
    ) -> Result<(), Escalation> {
        let id = self
            .engine
            .function_id(function)
            .ok_or_else(|| FlowError::UnknownFunction(function.to_owned()))?;
        tracing::trace!(from = self.name, to = function, spawn = options.spawn, "flow requested");
        self.effects.flows.push(PendingFlow {
            function: id,
            argument,
            spawn: options.spawn,
            callback: options.callback,
        });
        Ok(())
    }

    /// Starts an asynchronous operation.
    ///
    /// The function does not complete (its post-duties, flows and next
    /// function wait) until every operation it started has settled.
    #[must_use]
    pub fn start_async(&mut self) -> AsyncOperation {
        *book(self.scope).asyncs.entry(self.unit).or_insert(0) += 1;
        AsyncOperation {
            thread: Arc::downgrade(self.thread),
            unit: self.unit,
            function: self.name.to_owned(),
            settled: false,
        }
    }
}

impl fmt::Debug for FunctionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("function", &self.name)
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

/// An asynchronous operation holding a function's completion open.
///
/// Settle it from any thread with [`complete`](Self::complete) or
/// [`fail`](Self::fail). Dropping it unsettled fails it.
pub struct AsyncOperation {
    thread: Weak<ThreadState<FunctionState>>,
    unit: WorkUnitId,
    function: String,
    settled: bool,
}

impl AsyncOperation {
    /// Reports success.
    pub fn complete(mut self) {
        self.settled = true;
        self.post(None);
    }

    /// Reports failure; it becomes the function's escalation.
    pub fn fail(mut self, cause: impl Into<Escalation>) {
        self.settled = true;
        self.post(Some(cause.into()));
    }

    fn post(&self, failure: Option<Escalation>) {
        let Some(thread) = self.thread.upgrade() else {
            tracing::debug!(function = %self.function, "async outcome for ended thread ignored");
            return;
        };
        let unit = self.unit;
        thread.submit(move |scope| settle(scope, unit, failure));
    }
}

impl Drop for AsyncOperation {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(function = %self.function, "async operation dropped unsettled");
            self.post(Some(
                FlowError::AsyncDropped {
                    function: self.function.clone(),
                }
                .into(),
            ));
        }
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("function", &self.function)
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

/// Applies an operation's outcome to its work unit.
fn settle(scope: &mut ThreadScope<FunctionState>, unit: WorkUnitId, failure: Option<Escalation>) {
    let Some(count) = book(scope).asyncs.get_mut(&unit) else {
        tracing::debug!(%unit, "async outcome for finished work unit ignored");
        return;
    };
    *count = count.saturating_sub(1);
    let remaining = *count;

    let resumed = match failure {
        Some(cause) => scope
            .existing_work_unit_latch(unit)
            .map(|latch| latch.fail(cause, true)),
        None if remaining == 0 => scope
            .existing_work_unit_latch(unit)
            .map(|latch| latch.release(false)),
        None => None,
    };
    scope.resume(resumed.unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_options_default_to_same_thread_without_callback() {
        let options = FlowOptions::new();
        assert!(!options.spawn);
        assert!(options.callback.is_none());

        let options = FlowOptions::new().spawn_thread().with_callback(|_| Ok(()));
        assert!(options.spawn);
        assert!(options.callback.is_some());
    }

    #[test]
    fn dropping_an_operation_of_an_ended_thread_is_harmless() {
        let operation = AsyncOperation {
            thread: Weak::new(),
            unit: WorkUnitId(0),
            function: "orphan".into(),
            settled: false,
        };
        drop(operation);
    }
}
