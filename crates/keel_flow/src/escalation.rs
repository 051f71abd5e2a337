//! Escalation tables.
//!
//! An escalation table maps error types to handler functions. Tables are
//! declared per function ([`FunctionBuilder::on_escalation`](crate::office::FunctionBuilder::on_escalation))
//! and once for the whole office
//! ([`OfficeBuilder::process_escalation`](crate::office::OfficeBuilder::process_escalation)).
//! The first route whose type matches wins.

use core::error::Error;

use keel_system::error::Escalation;

use crate::state::FunctionId;

/// One route: an error type and the function that handles it.
#[derive(Clone)]
pub(crate) struct EscalationRoute {
    matches: fn(&Escalation) -> bool,
    type_name: &'static str,
    pub(crate) handler: FunctionId,
}

impl EscalationRoute {
    pub(crate) fn new<E: Error + 'static>(handler: FunctionId) -> Self {
        Self {
            matches: Escalation::is::<E>,
            type_name: core::any::type_name::<E>(),
            handler,
        }
    }
}

impl core::fmt::Debug for EscalationRoute {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EscalationRoute")
            .field("type", &self.type_name)
            .field("handler", &self.handler)
            .finish()
    }
}

/// Routes in declaration order.
#[derive(Debug, Clone, Default)]
pub(crate) struct EscalationTable {
    routes: Vec<EscalationRoute>,
}

impl EscalationTable {
    pub(crate) fn push(&mut self, route: EscalationRoute) {
        self.routes.push(route);
    }

    /// Returns the handler of the first route matching `escalation`.
    pub(crate) fn find(&self, escalation: &Escalation) -> Option<FunctionId> {
        self.routes
            .iter()
            .find(|route| (route.matches)(escalation))
            .map(|route| route.handler)
    }
}
