//! Continuation state.
//!
//! A [`FunctionState`] is the continuation that waits on latches: one step
//! of one chain, plus everything that runs after it. It records where the
//! step is in its lifecycle so that, when a latch lets it go, execution
//! resumes exactly where it stopped:
//!
//! ```text
//! Load ──► Ready ──► Govern ──► PreDuties ──► Body ──► AwaitingAsync ──► PostDuties ──► Complete
//!  │         │                                   │            │
//!  └─────────┴──── suspended on a latch ─────────┘────────────┘
//! ```
//!
//! Per-thread bookkeeping that outlives a single step ([`ThreadBook`]) lives
//! in the thread's scope locals, so it is only touched under the thread's
//! exclusive access.

use std::sync::Arc;

use hashbrown::HashMap;
use keel_system::context::{ThreadState, WorkUnitId};
use keel_system::error::Escalation;
use keel_system::resource::{GovernanceIndex, Object};

use crate::function::FlowCallback;
use crate::governance::{GovernanceAction, GovernanceState};
use crate::process::ProcessControl;

/// Position of a function in the office's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FunctionId(pub(crate) usize);

/// Position of a duty in the office's duty table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DutyId(pub(crate) usize);

/// Position of a team in the office's team table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TeamId(pub(crate) usize);

/// What a step does.
pub(crate) enum Work {
    /// Run a managed function.
    Function { function: FunctionId, unit: WorkUnitId },
    /// Run a duty on behalf of `function`, sharing its work unit.
    Duty {
        function: FunctionId,
        unit: WorkUnitId,
        duty: DutyId,
    },
    /// Apply a governance action.
    Governance {
        governance: GovernanceIndex,
        action: GovernanceAction,
    },
    /// Report a flow's outcome to its callback.
    ///
    /// `spawned` callbacks report a child thread's end to its parent and are
    /// not part of the parent's main chain.
    Callback {
        outcome: Option<Escalation>,
        spawned: bool,
    },
    /// Re-raise an escalation at thread level once governance is wound down.
    Raise(Escalation),
}

/// Resource loading progress, as cursors into the load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Load(usize),
    Ready(usize),
    Loaded,
}

/// Lifecycle progress of a function (or duty) once its resources are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Govern,
    PreDuties(usize),
    Body,
    AwaitingAsync,
    PostDuties(usize),
    Complete,
}

/// A flow requested by function logic, started when the function completes.
pub(crate) struct PendingFlow {
    pub(crate) function: FunctionId,
    pub(crate) argument: Option<Object>,
    pub(crate) spawn: bool,
    pub(crate) callback: Option<FlowCallback>,
}

/// What function logic asked for beyond its own completion.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) next_argument: Option<Object>,
    pub(crate) flows: Vec<PendingFlow>,
}

/// One step of a continuation chain and everything after it.
pub(crate) struct FunctionState {
    pub(crate) thread: Arc<ThreadState<FunctionState>>,
    pub(crate) control: Arc<ProcessControl>,
    pub(crate) work: Work,
    pub(crate) phase: Phase,
    pub(crate) stage: Stage,
    pub(crate) argument: Option<Object>,
    pub(crate) effects: Effects,
    pub(crate) callback: Option<FlowCallback>,
    pub(crate) failure: Option<Escalation>,
    pub(crate) then: Option<Box<FunctionState>>,
}

impl FunctionState {
    pub(crate) fn new(
        thread: Arc<ThreadState<FunctionState>>,
        control: Arc<ProcessControl>,
        work: Work,
        argument: Option<Object>,
        then: Option<Box<FunctionState>>,
    ) -> Self {
        Self {
            thread,
            control,
            work,
            phase: Phase::Load(0),
            stage: Stage::Govern,
            argument,
            effects: Effects::default(),
            callback: None,
            failure: None,
            then,
        }
    }

    #[must_use]
    pub(crate) fn with_callback(mut self, callback: FlowCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// The work unit this state loads resources for, if any.
    pub(crate) fn work_unit(&self) -> Option<WorkUnitId> {
        match self.work {
            Work::Function { unit, .. } | Work::Duty { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

/// The result of advancing a chain by one step.
pub(crate) enum ContinuationStep {
    /// The chain has nothing left to run.
    Terminal,
    /// The state is parked on a latch, or handed elsewhere.
    Suspended,
    /// Run this state next.
    Next(FunctionState),
    /// Start new threads, then carry on with `next`.
    FanOut {
        spawned: Vec<FunctionState>,
        next: Option<Box<FunctionState>>,
    },
}

impl ContinuationStep {
    pub(crate) fn from_chain(chain: Option<Box<FunctionState>>) -> Self {
        match chain {
            Some(next) => ContinuationStep::Next(*next),
            None => ContinuationStep::Terminal,
        }
    }
}

/// Links a spawned thread back to the flow that started it.
pub(crate) struct ThreadOrigin {
    pub(crate) parent: Arc<ThreadState<FunctionState>>,
    pub(crate) callback: FlowCallback,
}

/// Per-thread bookkeeping, kept in the thread's scope locals.
#[derive(Default)]
pub(crate) struct ThreadBook {
    pub(crate) origin: Option<ThreadOrigin>,
    /// Spawned flows whose callbacks have not run yet.
    pub(crate) pending_callbacks: usize,
    /// The main chain ended while callbacks were pending.
    pub(crate) idle: bool,
    pub(crate) finished: bool,
    /// Raised by a spawned flow's callback while the main chain was busy.
    pub(crate) deferred: Option<Escalation>,
    /// The thread escalated to its origin callback.
    pub(crate) escalated: Option<Escalation>,
    /// A process-level handler is running on this thread.
    pub(crate) handling: bool,
    pub(crate) governance: GovernanceState,
    /// Outstanding asynchronous operations per work unit.
    pub(crate) asyncs: HashMap<WorkUnitId, usize>,
}
