//! Administration duties.
//!
//! A [`Duty`] runs before (pre-duty) or after (post-duty) a function's logic,
//! over resources it administers: validating a loaded value, enlisting a
//! connection in a transaction, stamping an audit record. Duties load their
//! own resources the same way functions do, so a duty can suspend on a
//! resource that is not ready yet.
//!
//! Governance requests made through the [`AdministrationContext`] are not
//! carried out inline: each becomes its own step, scheduled on the
//! governance's team, before the function carries on.

use core::any::{Any, type_name};
use core::fmt;
use std::sync::Arc;

use keel_system::context::{ThreadScope, WorkUnitId};
use keel_system::error::{Escalation, ResourceError};
use keel_system::resource::{GovernanceIndex, Object, ResourceIndex};

use crate::governance::GovernanceAction;
use crate::state::FunctionState;

/// Work run around a function over the resources it administers.
///
/// # Example
///
/// ```
/// use keel_flow::administration::{AdministrationContext, Duty};
/// use keel_system::error::Escalation;
///
/// let audit = |ctx: &mut AdministrationContext<'_>| -> Result<(), Escalation> {
///     tracing::info!(function = ctx.function_name(), "audited");
///     Ok(())
/// };
/// fn is_duty(_: impl Duty) {}
/// is_duty(audit);
/// ```
pub trait Duty: Send + Sync + 'static {
    /// Administers.
    ///
    /// # Errors
    ///
    /// An escalation handled like one raised by the function itself.
    fn administer(&self, ctx: &mut AdministrationContext<'_>) -> Result<(), Escalation>;
}

impl<F> Duty for F
where
    F: Fn(&mut AdministrationContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
{
    fn administer(&self, ctx: &mut AdministrationContext<'_>) -> Result<(), Escalation> {
        self(ctx)
    }
}

/// What a duty sees while it runs.
pub struct AdministrationContext<'a> {
    scope: &'a mut ThreadScope<FunctionState>,
    duty: &'a str,
    function: &'a str,
    unit: WorkUnitId,
    requests: Vec<(GovernanceIndex, GovernanceAction)>,
    governed: Vec<(GovernanceIndex, ResourceIndex, Object)>,
}

impl<'a> AdministrationContext<'a> {
    pub(crate) fn new(
        scope: &'a mut ThreadScope<FunctionState>,
        duty: &'a str,
        function: &'a str,
        unit: WorkUnitId,
    ) -> Self {
        Self {
            scope,
            duty,
            function,
            unit,
            requests: Vec::new(),
            governed: Vec::new(),
        }
    }

    /// Governance placements and action requests, in the order made.
    pub(crate) fn into_requests(
        self,
    ) -> (
        Vec<(GovernanceIndex, ResourceIndex, Object)>,
        Vec<(GovernanceIndex, GovernanceAction)>,
    ) {
        (self.governed, self.requests)
    }

    /// Returns the duty's name.
    #[must_use]
    pub fn duty_name(&self) -> &str {
        self.duty
    }

    /// Returns the name of the function being administered.
    #[must_use]
    pub fn function_name(&self) -> &str {
        self.function
    }

    /// Returns the object of a resource the duty administers.
    ///
    /// # Errors
    ///
    /// The resource's failure, [`ResourceError::NotLoaded`], or
    /// [`ResourceError::TypeMismatch`].
    pub fn object<T: Any + Send + Sync>(&self, index: ResourceIndex) -> Result<Arc<T>, Escalation> {
        self.scope.object(Some(self.unit), index)?.downcast::<T>().map_err(|_| {
            ResourceError::TypeMismatch {
                name: self.scope.process().registry().name_of(index),
                expected: type_name::<T>(),
            }
            .into()
        })
    }

    /// Places the object of `index` under `governance`.
    ///
    /// # Errors
    ///
    /// The resource's failure or [`ResourceError::NotLoaded`].
    pub fn govern(&mut self, governance: GovernanceIndex, index: ResourceIndex) -> Result<(), Escalation> {
        let object = self.scope.object(Some(self.unit), index)?;
        self.governed.push((governance, index, object));
        Ok(())
    }

    /// Requests that `governance` be activated.
    pub fn activate(&mut self, governance: GovernanceIndex) {
        self.requests.push((governance, GovernanceAction::Activate));
    }

    /// Requests that `governance` be enforced now rather than at thread end.
    pub fn enforce(&mut self, governance: GovernanceIndex) {
        self.requests.push((governance, GovernanceAction::Enforce));
    }

    /// Requests that `governance` be disregarded now.
    pub fn disregard(&mut self, governance: GovernanceIndex) {
        self.requests.push((governance, GovernanceAction::Disregard));
    }
}

impl fmt::Debug for AdministrationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdministrationContext")
            .field("duty", &self.duty)
            .field("function", &self.function)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}
