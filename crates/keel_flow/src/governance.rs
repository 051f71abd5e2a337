//! Governance over resources.
//!
//! A [`Governance`] oversees a set of objects for the life of a thread, the
//! way a transaction oversees the connections enlisted in it:
//!
//! - **activate** - governance begins (for example, `BEGIN`)
//! - **enforce** - the thread completed normally (for example, `COMMIT`)
//! - **disregard** - the thread escalated (for example, `ROLLBACK`)
//!
//! Objects come under governance in two ways: a resource instance declares
//! it with [`ResourceInstance::governed_by`](keel_system::resource::ResourceInstance::governed_by),
//! or a duty calls [`AdministrationContext::govern`](crate::administration::AdministrationContext::govern).
//! Every action runs as its own step on the governance's team.
//!
//! When a thread finishes, governances still active are enforced; when it
//! ends through an escalation, they are disregarded. Either happens before
//! the thread's resources are released.

use core::any::Any;
use core::fmt;
use std::collections::BTreeMap;

use keel_system::error::Escalation;
use keel_system::resource::{GovernanceIndex, Object, ResourceIndex};

/// A governance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovernanceAction {
    /// Begin governing.
    Activate,
    /// Conclude successfully.
    Enforce,
    /// Abandon.
    Disregard,
}

impl fmt::Display for GovernanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernanceAction::Activate => write!(f, "activate"),
            GovernanceAction::Enforce => write!(f, "enforce"),
            GovernanceAction::Disregard => write!(f, "disregard"),
        }
    }
}

/// Oversight applied to the objects placed under it.
///
/// # Example
///
/// ```
/// use keel_flow::governance::{Governance, GovernanceContext};
/// use keel_system::error::Escalation;
///
/// struct Audit;
///
/// impl Governance for Audit {
///     fn enforce(&self, ctx: &GovernanceContext<'_>) -> Result<(), Escalation> {
///         tracing::info!(governance = ctx.name(), objects = ctx.len(), "committed");
///         Ok(())
///     }
///
///     fn disregard(&self, _ctx: &GovernanceContext<'_>) -> Result<(), Escalation> {
///         Ok(())
///     }
/// }
/// ```
pub trait Governance: Send + Sync + 'static {
    /// Begins governing.
    ///
    /// # Errors
    ///
    /// An escalation raised on the thread that requested activation.
    fn activate(&self, _ctx: &GovernanceContext<'_>) -> Result<(), Escalation> {
        Ok(())
    }

    /// Concludes governance after normal completion.
    ///
    /// # Errors
    ///
    /// An escalation raised on the thread being completed.
    fn enforce(&self, ctx: &GovernanceContext<'_>) -> Result<(), Escalation>;

    /// Abandons governance after an escalation.
    ///
    /// # Errors
    ///
    /// An escalation raised on the thread being wound down.
    fn disregard(&self, ctx: &GovernanceContext<'_>) -> Result<(), Escalation>;
}

/// What a governance action sees: the governed objects.
pub struct GovernanceContext<'a> {
    name: &'a str,
    objects: &'a [(ResourceIndex, Object)],
}

impl<'a> GovernanceContext<'a> {
    pub(crate) fn new(name: &'a str, objects: &'a [(ResourceIndex, Object)]) -> Self {
        Self { name, objects }
    }

    /// Returns the governance name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Returns the number of governed objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing has been placed under governance.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterates over the governed objects in the order they were governed.
    pub fn objects(&self) -> impl Iterator<Item = (ResourceIndex, &Object)> {
        self.objects.iter().map(|(index, object)| (*index, object))
    }

    /// Returns the governed object of `index` as `T`.
    #[must_use]
    pub fn object_as<T: Any>(&self, index: ResourceIndex) -> Option<&T> {
        self.objects
            .iter()
            .find(|(governed, _)| *governed == index)
            .and_then(|(_, object)| object.downcast_ref::<T>())
    }
}

/// Per-thread record of governed objects.
#[derive(Default)]
pub(crate) struct GovernanceState {
    entries: BTreeMap<GovernanceIndex, GovernanceEntry>,
}

#[derive(Default)]
pub(crate) struct GovernanceEntry {
    pub(crate) objects: Vec<(ResourceIndex, Object)>,
    pub(crate) active: bool,
}

impl GovernanceState {
    /// Places the object of `index` under `governance`, once.
    pub(crate) fn govern(&mut self, governance: GovernanceIndex, index: ResourceIndex, object: Object) {
        let entry = self.entries.entry(governance).or_default();
        if !entry.objects.iter().any(|(governed, _)| *governed == index) {
            entry.objects.push((index, object));
        }
    }

    pub(crate) fn entry(&mut self, governance: GovernanceIndex) -> &mut GovernanceEntry {
        self.entries.entry(governance).or_default()
    }

    pub(crate) fn is_active(&self, governance: GovernanceIndex) -> bool {
        self.entries.get(&governance).is_some_and(|entry| entry.active)
    }

    /// Returns the active governances in index order.
    pub(crate) fn active(&self) -> Vec<GovernanceIndex> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Removes and returns the entry for `governance`.
    pub(crate) fn take(&mut self, governance: GovernanceIndex) -> Option<GovernanceEntry> {
        self.entries.remove(&governance)
    }

    /// Removes every entry.
    pub(crate) fn drain(&mut self) -> Vec<(GovernanceIndex, GovernanceEntry)> {
        core::mem::take(&mut self.entries).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_system::resource::{ResourceScope, object};

    #[test]
    fn objects_are_governed_once() {
        let mut state = GovernanceState::default();
        let tx = GovernanceIndex(0);
        let conn = ResourceIndex::new(ResourceScope::Thread, 0);

        state.govern(tx, conn, object(1_u8));
        state.govern(tx, conn, object(2_u8));
        assert_eq!(state.entry(tx).objects.len(), 1);
        assert!(!state.is_active(tx));

        state.entry(tx).active = true;
        assert_eq!(state.active(), vec![tx]);

        let entry = state.take(tx).expect("entry present");
        let ctx = GovernanceContext::new("tx", &entry.objects);
        assert_eq!(ctx.object_as::<u8>(conn), Some(&1));
        assert!(state.active().is_empty());
    }

    #[test]
    fn active_governances_are_listed_in_index_order() {
        let mut state = GovernanceState::default();
        for index in [3, 1, 2] {
            state.entry(GovernanceIndex(index)).active = index != 2;
        }
        assert_eq!(state.active(), vec![GovernanceIndex(1), GovernanceIndex(3)]);
    }
}
