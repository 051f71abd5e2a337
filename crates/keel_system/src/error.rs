//! Escalations and resource errors.
//!
//! An [`Escalation`] is the failure value that travels through the kernel:
//! out of function logic, through latches to every waiting continuation,
//! and up the escalation search to a handler. It wraps any error type in an
//! [`Arc`] so one failure can be delivered to many waiters while still being
//! recognisably the *same* failure ([`Escalation::ptr_eq`]).
//!
//! [`ResourceError`] covers the failures the kernel itself raises.

use core::error::Error;
use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use crate::resource::ResourceIndex;

/// A shareable failure raised by a resource, a function or the kernel.
///
/// Any `Error + Send + Sync + 'static` converts into an `Escalation`, so
/// function logic can use `?` directly on its own error types.
///
/// # Example
///
/// ```
/// use keel_system::error::{Escalation, ResourceError};
///
/// let escalation = Escalation::new(ResourceError::NotLoaded("db".into()));
/// let delivered = escalation.clone();
///
/// assert!(delivered.ptr_eq(&escalation));
/// assert!(delivered.is::<ResourceError>());
/// ```
#[derive(Clone)]
pub struct Escalation {
    error: Arc<dyn Error + Send + Sync + 'static>,
    type_name: &'static str,
}

impl Escalation {
    /// Wraps an error.
    #[must_use]
    pub fn new<E: Error + Send + Sync + 'static>(error: E) -> Self {
        Self {
            error: Arc::new(error),
            type_name: core::any::type_name::<E>(),
        }
    }

    /// Wraps an already boxed error.
    #[must_use]
    pub fn from_boxed(error: Box<dyn Error + Send + Sync + 'static>) -> Self {
        Self {
            error: Arc::from(error),
            type_name: "dyn core::error::Error",
        }
    }

    /// Creates an escalation carrying only a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Returns `true` if the wrapped error is of type `E`.
    #[must_use]
    pub fn is<E: Error + 'static>(&self) -> bool {
        self.error.is::<E>()
    }

    /// Returns the wrapped error as `E`, if it is one.
    #[must_use]
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    /// Returns `true` if both escalations share the same underlying failure.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        core::ptr::eq(
            Arc::as_ptr(&self.error).cast::<()>(),
            Arc::as_ptr(&other.error).cast::<()>(),
        )
    }

    /// Returns the wrapped error.
    #[must_use]
    pub fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.error
    }

    /// Returns the type name of the wrapped error, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl<E: Error + Send + Sync + 'static> From<E> for Escalation {
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalation")
            .field("type", &self.type_name)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

/// A plain message escalation created by [`Escalation::msg`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct Message(pub String);

/// Failures raised by the kernel while sourcing and accessing resources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// A waiter registered on a latch outlived the configured timeout.
    #[error("resource '{name}' was not available within {timeout:?}")]
    Timeout {
        /// Resource (or operation) that timed out.
        name: String,
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The resource has not completed sourcing.
    #[error("resource not loaded: {0}")]
    NotLoaded(String),

    /// The sourced object is not of the requested type.
    #[error("resource '{name}' is not a {expected}")]
    TypeMismatch {
        /// Resource name.
        name: String,
        /// Requested type.
        expected: &'static str,
    },

    /// An input-bound resource was not supplied when the process was invoked.
    #[error("input not supplied: {0}")]
    InputMissing(String),

    /// The execution context was shut down while the resource was pending.
    #[error("resource abandoned during shutdown: {0}")]
    ShuttingDown(String),

    /// No resource is bound at the requested index.
    #[error("no resource bound at {0}")]
    NotBound(ResourceIndex),
}
