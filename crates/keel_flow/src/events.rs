//! Execution events.
//!
//! The office publishes a [`FlowEvent`] at each notable point of a process:
//! start and end of processes, threads and functions, suspensions,
//! escalations and governance actions. Observers registered with
//! [`Office::observe`](crate::office::Office::observe) receive every event,
//! in registration order, on the thread that produced it.
//!
//! # Example
//!
//! ```ignore
//! office.observe(|event: &FlowEvent| {
//!     if let FlowEvent::FunctionStart { function, .. } = event {
//!         tracing::info!(%function, "running");
//!     }
//! });
//! ```

use std::sync::Arc;

use keel_system::context::{ProcessId, ThreadStateId};
use parking_lot::RwLock;

use crate::governance::GovernanceAction;

/// Something that happened while a process ran.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    // ─────────────────────────────────────────────────────────────────────────
    // Process Events
    // ─────────────────────────────────────────────────────────────────────────
    /// A process was invoked.
    ProcessStart {
        /// The process.
        process: ProcessId,
        /// Its first function.
        function: String,
    },

    /// A process completed normally.
    ProcessComplete {
        /// The process.
        process: ProcessId,
    },

    /// A process failed with an unhandled escalation.
    ProcessFailed {
        /// The process.
        process: ProcessId,
        /// The escalation message.
        error: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Thread Events
    // ─────────────────────────────────────────────────────────────────────────
    /// A flow started a new thread.
    ThreadSpawned {
        /// The process.
        process: ProcessId,
        /// The new thread.
        thread: ThreadStateId,
        /// The flow's first function.
        function: String,
    },

    /// A thread finished and released its resources.
    ThreadComplete {
        /// The process.
        process: ProcessId,
        /// The thread.
        thread: ThreadStateId,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Function Events
    // ─────────────────────────────────────────────────────────────────────────
    /// A function's logic is about to run.
    FunctionStart {
        /// The process.
        process: ProcessId,
        /// The thread.
        thread: ThreadStateId,
        /// The function.
        function: String,
    },

    /// A function's logic and post-duties finished.
    FunctionComplete {
        /// The process.
        process: ProcessId,
        /// The thread.
        thread: ThreadStateId,
        /// The function.
        function: String,
    },

    /// A function is waiting on a resource or an asynchronous operation.
    FunctionSuspended {
        /// The process.
        process: ProcessId,
        /// The thread.
        thread: ThreadStateId,
        /// The function.
        function: String,
        /// What it waits on.
        waiting_on: String,
    },

    /// A step raised an escalation.
    Escalated {
        /// The process.
        process: ProcessId,
        /// The thread.
        thread: ThreadStateId,
        /// What raised it.
        source: String,
        /// The escalation message.
        error: String,
    },

    /// An escalation was caught by a handler function.
    EscalationHandled {
        /// The process.
        process: ProcessId,
        /// The handler function.
        handler: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Governance Events
    // ─────────────────────────────────────────────────────────────────────────
    /// A governance action ran.
    Governance {
        /// The process.
        process: ProcessId,
        /// The thread.
        thread: ThreadStateId,
        /// The governance name.
        governance: String,
        /// What was done.
        action: GovernanceAction,
    },
}

impl FlowEvent {
    /// Returns the process the event belongs to.
    #[must_use]
    pub fn process(&self) -> &ProcessId {
        match self {
            FlowEvent::ProcessStart { process, .. }
            | FlowEvent::ProcessComplete { process }
            | FlowEvent::ProcessFailed { process, .. }
            | FlowEvent::ThreadSpawned { process, .. }
            | FlowEvent::ThreadComplete { process, .. }
            | FlowEvent::FunctionStart { process, .. }
            | FlowEvent::FunctionComplete { process, .. }
            | FlowEvent::FunctionSuspended { process, .. }
            | FlowEvent::Escalated { process, .. }
            | FlowEvent::EscalationHandled { process, .. }
            | FlowEvent::Governance { process, .. } => process,
        }
    }
}

type Observer = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

/// Registered event observers.
#[derive(Default)]
pub(crate) struct Observers {
    observers: RwLock<Vec<Observer>>,
}

impl Observers {
    pub(crate) fn add(&self, observer: impl Fn(&FlowEvent) + Send + Sync + 'static) {
        self.observers.write().push(Arc::new(observer));
    }

    /// Delivers `event` to every observer.
    ///
    /// Observers are copied out first so one may register another.
    pub(crate) fn emit(&self, event: FlowEvent) {
        let observers: Vec<Observer> = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        for observer in &observers {
            observer(&event);
        }
    }
}
