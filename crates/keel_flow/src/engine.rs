//! The continuation engine.
//!
//! The engine owns every resolved definition of an office and drives
//! [`FunctionState`]s through their lifecycle. One call to `drive` runs
//! inside the thread's exclusive section and advances the chain step by
//! step until it suspends on a latch, hands over to another team, or ends.
//!
//! Escalations are searched for a handler in this order:
//!
//! 1. the failing function's escalation table
//! 2. the nearest enclosing same-thread flow callback
//! 3. the thread's origin callback, for spawned flows
//! 4. the office's process handlers
//!
//! Active governance is disregarded before steps 3 and 4. An escalation that
//! reaches none of them fails the process.

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use keel_system::container::Proceed;
use keel_system::context::{
    AssetHost, ProcessConfig, ProcessId, ProcessState, ThreadScope, ThreadState, WorkUnitId,
};
use keel_system::error::Escalation;
use keel_system::latch::{LatchOutcome, Resumed};
use keel_system::resource::{GovernanceIndex, Object, ResourceIndex, ResourceRegistry, object};
use keel_system::source::ReleaseCause;

use crate::administration::{AdministrationContext, Duty};
use crate::asset::AssetManager;
use crate::config::OfficeConfig;
use crate::error::{FlowError, InvokeError};
use crate::escalation::EscalationTable;
use crate::events::{FlowEvent, Observers};
use crate::function::{FunctionContext, ManagedFunction};
use crate::governance::{Governance, GovernanceAction, GovernanceContext};
use crate::process::{ProcessControl, ProcessHandle};
use crate::state::{
    ContinuationStep, DutyId, Effects, FunctionId, FunctionState, Phase, Stage, TeamId,
    ThreadBook, ThreadOrigin, Work,
};
use crate::team::{Job, Team};

type Thread = Arc<ThreadState<FunctionState>>;

/// A function with its references resolved.
pub(crate) struct FunctionDef {
    pub(crate) name: String,
    pub(crate) function: Arc<dyn ManagedFunction>,
    pub(crate) order: Arc<[ResourceIndex]>,
    pub(crate) next: Option<FunctionId>,
    pub(crate) team: TeamId,
    pub(crate) escalations: EscalationTable,
    pub(crate) governance: Vec<GovernanceIndex>,
    pub(crate) pre: Vec<DutyId>,
    pub(crate) post: Vec<DutyId>,
}

pub(crate) struct DutyDef {
    pub(crate) name: String,
    pub(crate) duty: Arc<dyn Duty>,
    pub(crate) order: Arc<[ResourceIndex]>,
    pub(crate) team: TeamId,
}

pub(crate) struct GovernanceDef {
    pub(crate) name: String,
    pub(crate) governance: Arc<dyn Governance>,
    pub(crate) team: TeamId,
}

pub(crate) struct TeamEntry {
    pub(crate) name: String,
    pub(crate) team: Arc<dyn Team>,
}

/// Everything an office knows, shared by its processes.
pub(crate) struct Engine {
    pub(crate) config: OfficeConfig,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) order: Arc<[ResourceIndex]>,
    pub(crate) functions: Vec<FunctionDef>,
    pub(crate) names: HashMap<String, FunctionId>,
    pub(crate) duties: Vec<DutyDef>,
    pub(crate) governances: Vec<GovernanceDef>,
    pub(crate) teams: Vec<TeamEntry>,
    pub(crate) default_team: TeamId,
    pub(crate) process_escalations: EscalationTable,
    pub(crate) observers: Observers,
    pub(crate) assets: Arc<AssetManager>,
}

/// Returns the thread's bookkeeping.
pub(crate) fn book(scope: &mut ThreadScope<FunctionState>) -> &mut ThreadBook {
    scope.locals_mut().get_or_default::<ThreadBook>()
}

enum Loaded {
    Ready(FunctionState),
    Suspended,
    Failed(FunctionState, Escalation),
}

impl Engine {
    pub(crate) fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.names.get(name).copied()
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        self.observers.emit(event);
    }

    /// Starts a process at `function`.
    pub(crate) fn invoke(
        self: &Arc<Self>,
        function: FunctionId,
        argument: Option<Object>,
        config: ProcessConfig,
    ) -> Result<ProcessHandle, InvokeError> {
        let engine = Arc::clone(self);
        let process = ProcessState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.order),
            config,
            move |resumed: Resumed<FunctionState>| engine.resume(resumed),
        );
        let host: Weak<dyn AssetHost> = Arc::downgrade(&process) as Weak<dyn AssetHost>;
        if let Err(error) = self.assets.register(host) {
            tracing::debug!(process = %process.id(), %error, "invocation refused");
            return Err(InvokeError::Closed);
        }
        let (control, handle) = ProcessControl::new(process.id().clone());

        let name = &self.functions[function.0].name;
        tracing::info!(process = %process.id(), function = %name, "process invoked");
        self.emit(FlowEvent::ProcessStart {
            process: process.id().clone(),
            function: name.clone(),
        });

        let thread = process.spawn_thread();
        let unit = process.next_work_unit();
        self.schedule(FunctionState::new(
            thread,
            control,
            Work::Function { function, unit },
            argument,
            None,
        ));
        Ok(handle)
    }

    /// Takes a continuation let go by a latch.
    pub(crate) fn resume(self: &Arc<Self>, resumed: Resumed<FunctionState>) {
        let Resumed {
            mut continuation,
            outcome,
        } = resumed;
        if let LatchOutcome::Failed(cause) = outcome {
            continuation.failure = Some(cause);
        }
        self.schedule(continuation);
    }

    /// Hands `state` to its team.
    pub(crate) fn schedule(self: &Arc<Self>, state: FunctionState) {
        let team = self.team_of(&state);
        let engine = Arc::clone(self);
        self.teams[team.0]
            .team
            .assign(Job::new("continuation", move || engine.execute(state)));
    }

    fn execute(self: Arc<Self>, state: FunctionState) {
        let thread = Arc::clone(&state.thread);
        thread.submit(move |scope| self.drive(scope, state));
    }

    fn team_of(&self, state: &FunctionState) -> TeamId {
        match state.work {
            Work::Function { function, .. } => self.functions[function.0].team,
            Work::Duty { duty, .. } => self.duties[duty.0].team,
            Work::Governance { governance, .. } => self
                .governances
                .get(governance.0)
                .map_or(self.default_team, |def| def.team),
            Work::Callback { .. } | Work::Raise(_) => self.default_team,
        }
    }

    fn describe(&self, state: &FunctionState) -> String {
        match state.work {
            Work::Function { function, .. } => self.functions[function.0].name.clone(),
            Work::Duty { duty, .. } => self.duties[duty.0].name.clone(),
            Work::Governance { governance, .. } => self
                .governances
                .get(governance.0)
                .map_or_else(|| governance.to_string(), |def| def.name.clone()),
            Work::Callback { .. } => "flow callback".to_owned(),
            Work::Raise(_) => "thread".to_owned(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Driving
    // ─────────────────────────────────────────────────────────────────────────

    /// Advances a chain inside the thread's exclusive section.
    fn drive(self: &Arc<Self>, scope: &mut ThreadScope<FunctionState>, mut state: FunctionState) {
        let thread = Arc::clone(&state.thread);
        let control = Arc::clone(&state.control);
        let team = self.team_of(&state);
        let mut inline = 0;

        loop {
            if control.is_failed() || book(scope).finished {
                self.discard(scope, &thread, &control, state);
                return;
            }
            if control.count_step() > self.config.max_process_steps {
                let limit = self.config.max_process_steps;
                self.fail_process(scope, &thread, &control, FlowError::StepLimitExceeded { limit }.into());
                self.discard(scope, &thread, &control, state);
                return;
            }

            let next = match self.step(scope, state) {
                ContinuationStep::Suspended => return,
                ContinuationStep::Terminal => self.chain_end(scope, &thread, &control),
                ContinuationStep::Next(next) => Some(next),
                ContinuationStep::FanOut { spawned, next } => {
                    for child in spawned {
                        self.schedule(child);
                    }
                    match next {
                        Some(next) => Some(*next),
                        None => self.chain_end(scope, &thread, &control),
                    }
                }
            };
            let Some(next) = next else {
                return;
            };

            inline += 1;
            if self.team_of(&next) != team || inline >= self.config.max_inline_steps {
                self.schedule(next);
                return;
            }
            state = next;
        }
    }

    fn step(self: &Arc<Self>, scope: &mut ThreadScope<FunctionState>, mut state: FunctionState) -> ContinuationStep {
        if let Some(cause) = state.failure.take() {
            return self.escalate(scope, state, cause);
        }
        match state.work {
            Work::Function { function, unit } => self.run_function(scope, state, function, unit),
            Work::Duty {
                function,
                unit,
                duty,
            } => self.run_duty(scope, state, function, unit, duty),
            Work::Governance { governance, action } => {
                self.run_governance(scope, state, governance, action)
            }
            Work::Callback { ref outcome, spawned } => {
                let outcome = outcome.clone();
                self.run_callback(scope, state, outcome, spawned)
            }
            Work::Raise(ref cause) => {
                let cause = cause.clone();
                let (thread, control) = (Arc::clone(&state.thread), Arc::clone(&state.control));
                drop(state);
                self.escalate_thread(scope, &thread, &control, cause)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Functions and duties
    // ─────────────────────────────────────────────────────────────────────────

    fn run_function(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        function: FunctionId,
        unit: WorkUnitId,
    ) -> ContinuationStep {
        let def = &self.functions[function.0];
        state = match self.load(scope, state, unit, &def.order, &def.name) {
            Loaded::Ready(state) => state,
            Loaded::Suspended => return ContinuationStep::Suspended,
            Loaded::Failed(state, cause) => return self.escalate(scope, state, cause),
        };

        loop {
            match state.stage {
                Stage::Govern => {
                    state.stage = Stage::PreDuties(0);
                    let wanted = self.wanted_governance(scope, unit, def);
                    if !wanted.is_empty() {
                        let (thread, control) = (Arc::clone(&state.thread), Arc::clone(&state.control));
                        let actions = wanted
                            .into_iter()
                            .map(|governance| (governance, GovernanceAction::Activate))
                            .collect();
                        return ContinuationStep::from_chain(governance_chain(
                            &thread,
                            &control,
                            actions,
                            Some(Box::new(state)),
                        ));
                    }
                }
                Stage::PreDuties(position) => match def.pre.get(position) {
                    Some(&duty) => {
                        state.stage = Stage::PreDuties(position + 1);
                        return ContinuationStep::Next(duty_state(state, function, unit, duty));
                    }
                    None => state.stage = Stage::Body,
                },
                Stage::Body => match self.run_body(scope, &mut state, def, unit) {
                    Ok(()) => state.stage = Stage::AwaitingAsync,
                    Err(cause) => return self.escalate(scope, state, cause),
                },
                Stage::AwaitingAsync => {
                    state.stage = Stage::PostDuties(0);
                    let outstanding = book(scope).asyncs.get(&unit).copied().unwrap_or(0);
                    if outstanding > 0 {
                        self.suspended(scope, &def.name, format!("{outstanding} async operations"));
                        let label = format!("async operations of '{}'", def.name);
                        if let Some(resumed) = scope.work_unit_latch(unit, &label).register(state) {
                            scope.resume([resumed]);
                        }
                        return ContinuationStep::Suspended;
                    }
                }
                Stage::PostDuties(position) => match def.post.get(position) {
                    Some(&duty) => {
                        state.stage = Stage::PostDuties(position + 1);
                        return ContinuationStep::Next(duty_state(state, function, unit, duty));
                    }
                    None => state.stage = Stage::Complete,
                },
                Stage::Complete => return self.complete_function(scope, state, function, unit),
            }
        }
    }

    fn run_body(
        &self,
        scope: &mut ThreadScope<FunctionState>,
        state: &mut FunctionState,
        def: &FunctionDef,
        unit: WorkUnitId,
    ) -> Result<(), Escalation> {
        let _span = tracing::debug_span!("function", name = %def.name, %unit).entered();
        self.emit(FlowEvent::FunctionStart {
            process: scope.process().id().clone(),
            thread: scope.id(),
            function: def.name.clone(),
        });

        let thread = Arc::clone(&state.thread);
        let argument = state.argument.take();
        let mut ctx = FunctionContext::new(self, scope, &thread, &def.name, unit, argument);
        let result = def.function.run(&mut ctx);
        state.effects = ctx.into_effects();
        result
    }

    fn run_duty(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        function: FunctionId,
        unit: WorkUnitId,
        duty: DutyId,
    ) -> ContinuationStep {
        let def = &self.duties[duty.0];
        state = match self.load(scope, state, unit, &def.order, &def.name) {
            Loaded::Ready(state) => state,
            Loaded::Suspended => return ContinuationStep::Suspended,
            Loaded::Failed(state, cause) => return self.escalate(scope, state, cause),
        };

        let owner = &self.functions[function.0].name;
        tracing::trace!(duty = %def.name, function = %owner, "administering");
        let mut ctx = AdministrationContext::new(scope, &def.name, owner, unit);
        let result = def.duty.administer(&mut ctx);
        let (governed, requests) = ctx.into_requests();
        if let Err(cause) = result {
            return self.escalate(scope, state, cause);
        }
        let unknown = requests
            .iter()
            .map(|(governance, _)| *governance)
            .chain(governed.iter().map(|(governance, ..)| *governance))
            .find(|governance| governance.0 >= self.governances.len());
        if let Some(unknown) = unknown {
            return self.escalate(scope, state, FlowError::UnknownGovernance(unknown).into());
        }

        let governance = &mut book(scope).governance;
        for (index, resource, object) in governed {
            governance.govern(index, resource, object);
        }
        let then = state.then.take();
        if requests.is_empty() {
            return ContinuationStep::from_chain(then);
        }
        ContinuationStep::from_chain(governance_chain(&state.thread, &state.control, requests, then))
    }

    /// Governances the function needs active before it runs: its own plus
    /// those its loaded resources declare. Objects are placed under them.
    fn wanted_governance(
        &self,
        scope: &mut ThreadScope<FunctionState>,
        unit: WorkUnitId,
        def: &FunctionDef,
    ) -> Vec<GovernanceIndex> {
        let mut wanted = def.governance.clone();
        for &index in def.order.iter() {
            let governed = scope
                .with_container(Some(unit), index, |container| container.governance().to_vec())
                .unwrap_or_default();
            if governed.is_empty() {
                continue;
            }
            let Ok(object) = scope.object(Some(unit), index) else {
                continue;
            };
            let state = &mut book(scope).governance;
            for governance in governed {
                state.govern(governance, index, Arc::clone(&object));
                if !wanted.contains(&governance) {
                    wanted.push(governance);
                }
            }
        }
        let state = &book(scope).governance;
        wanted.retain(|governance| !state.is_active(*governance));
        wanted
    }

    /// Walks the load order: every resource sourced, then every resource ready.
    fn load(
        &self,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        unit: WorkUnitId,
        order: &[ResourceIndex],
        waiter: &str,
    ) -> Loaded {
        loop {
            let (cursor, loading) = match state.phase {
                Phase::Load(cursor) => (cursor, true),
                Phase::Ready(cursor) => (cursor, false),
                Phase::Loaded => return Loaded::Ready(state),
            };
            let Some(&index) = order.get(cursor) else {
                state.phase = if loading { Phase::Ready(0) } else { Phase::Loaded };
                continue;
            };

            let proceed = if loading {
                scope.ensure_loaded(Some(unit), index, state)
            } else {
                scope.check_ready(Some(unit), index, state)
            };
            state = match proceed {
                Proceed::Proceed(state) => state,
                Proceed::Suspended => {
                    let resource = self.registry.name_of(index);
                    self.suspended(scope, waiter, resource);
                    return Loaded::Suspended;
                }
            };
            if let Err(cause) = scope.object(Some(unit), index) {
                return Loaded::Failed(state, cause);
            }
            state.phase = if loading {
                Phase::Load(cursor + 1)
            } else {
                Phase::Ready(cursor + 1)
            };
        }
    }

    fn suspended(&self, scope: &ThreadScope<FunctionState>, waiter: &str, waiting_on: String) {
        tracing::trace!(function = waiter, waiting_on = %waiting_on, "suspended");
        self.emit(FlowEvent::FunctionSuspended {
            process: scope.process().id().clone(),
            thread: scope.id(),
            function: waiter.to_owned(),
            waiting_on,
        });
    }

    /// Releases the work unit and lays out what runs next: same-thread flows
    /// (each followed by its callback), the next function, then the rest of
    /// the enclosing chain. Spawned flows start on new threads.
    fn complete_function(
        &self,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        function: FunctionId,
        unit: WorkUnitId,
    ) -> ContinuationStep {
        let def = &self.functions[function.0];
        self.unload_unit(scope, unit, ReleaseCause::Completed);
        self.emit(FlowEvent::FunctionComplete {
            process: scope.process().id().clone(),
            thread: scope.id(),
            function: def.name.clone(),
        });

        let Effects {
            next_argument,
            flows,
        } = core::mem::take(&mut state.effects);
        let thread = Arc::clone(&state.thread);
        let control = Arc::clone(&state.control);
        let process = Arc::clone(scope.process());

        let mut tail = state.then.take();
        if let Some(next) = def.next {
            tail = Some(Box::new(FunctionState::new(
                Arc::clone(&thread),
                Arc::clone(&control),
                Work::Function {
                    function: next,
                    unit: process.next_work_unit(),
                },
                next_argument,
                tail,
            )));
        }

        let (spawn, local): (Vec<_>, Vec<_>) = flows.into_iter().partition(|flow| flow.spawn);
        for flow in local.into_iter().rev() {
            if let Some(callback) = flow.callback {
                tail = Some(Box::new(
                    FunctionState::new(
                        Arc::clone(&thread),
                        Arc::clone(&control),
                        Work::Callback {
                            outcome: None,
                            spawned: false,
                        },
                        None,
                        tail,
                    )
                    .with_callback(callback),
                ));
            }
            tail = Some(Box::new(FunctionState::new(
                Arc::clone(&thread),
                Arc::clone(&control),
                Work::Function {
                    function: flow.function,
                    unit: process.next_work_unit(),
                },
                flow.argument,
                tail,
            )));
        }

        let mut spawned = Vec::with_capacity(spawn.len());
        for flow in spawn {
            let child = process.spawn_thread();
            if let Some(callback) = flow.callback {
                book(scope).pending_callbacks += 1;
                let origin = ThreadOrigin {
                    parent: Arc::clone(&thread),
                    callback,
                };
                child.submit(move |child_scope| book(child_scope).origin = Some(origin));
            }
            let name = &self.functions[flow.function.0].name;
            tracing::debug!(process = %process.id(), thread = %child.id(), function = %name, "thread spawned");
            self.emit(FlowEvent::ThreadSpawned {
                process: process.id().clone(),
                thread: child.id(),
                function: name.clone(),
            });
            spawned.push(FunctionState::new(
                child,
                Arc::clone(&control),
                Work::Function {
                    function: flow.function,
                    unit: process.next_work_unit(),
                },
                flow.argument,
                None,
            ));
        }

        if spawned.is_empty() {
            ContinuationStep::from_chain(tail)
        } else {
            ContinuationStep::FanOut {
                spawned,
                next: tail,
            }
        }
    }

    fn unload_unit(&self, scope: &mut ThreadScope<FunctionState>, unit: WorkUnitId, cause: ReleaseCause) {
        scope.unload_work_unit(unit, cause);
        book(scope).asyncs.remove(&unit);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Governance and callbacks
    // ─────────────────────────────────────────────────────────────────────────

    fn run_governance(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        governance: GovernanceIndex,
        action: GovernanceAction,
    ) -> ContinuationStep {
        let Some(def) = self.governances.get(governance.0) else {
            return self.escalate(scope, state, FlowError::UnknownGovernance(governance).into());
        };
        let process = scope.process().id().clone();
        let thread = scope.id();

        let governed = &mut book(scope).governance;
        let result = match action {
            GovernanceAction::Activate => {
                let entry = governed.entry(governance);
                if entry.active {
                    return ContinuationStep::from_chain(state.then.take());
                }
                let result = def
                    .governance
                    .activate(&GovernanceContext::new(&def.name, &entry.objects));
                entry.active = result.is_ok();
                result
            }
            GovernanceAction::Enforce | GovernanceAction::Disregard => {
                let Some(entry) = governed.take(governance).filter(|entry| entry.active) else {
                    return ContinuationStep::from_chain(state.then.take());
                };
                let ctx = GovernanceContext::new(&def.name, &entry.objects);
                if action == GovernanceAction::Enforce {
                    def.governance.enforce(&ctx)
                } else {
                    def.governance.disregard(&ctx)
                }
            }
        };

        tracing::debug!(%process, governance = %def.name, %action, ok = result.is_ok(), "governance action");
        self.emit(FlowEvent::Governance {
            process,
            thread,
            governance: def.name.clone(),
            action,
        });
        match result {
            Ok(()) => ContinuationStep::from_chain(state.then.take()),
            Err(cause) if action == GovernanceAction::Disregard => {
                tracing::warn!(governance = %def.name, error = %cause, "disregard failed");
                ContinuationStep::from_chain(state.then.take())
            }
            Err(cause) => self.escalate(scope, state, cause),
        }
    }

    fn run_callback(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        outcome: Option<Escalation>,
        spawned: bool,
    ) -> ContinuationStep {
        let result = match state.callback.take() {
            Some(callback) => callback(outcome),
            None => Ok(()),
        };
        if !spawned {
            return match result {
                Ok(()) => ContinuationStep::from_chain(state.then.take()),
                Err(cause) => self.escalate(scope, state, cause),
            };
        }

        let book = book(scope);
        book.pending_callbacks = book.pending_callbacks.saturating_sub(1);
        if let Err(cause) = result {
            book.deferred.get_or_insert(cause);
        }
        if book.idle && book.pending_callbacks == 0 {
            book.idle = false;
            ContinuationStep::Terminal
        } else {
            ContinuationStep::Suspended
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Escalation
    // ─────────────────────────────────────────────────────────────────────────

    fn escalate(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        mut state: FunctionState,
        cause: Escalation,
    ) -> ContinuationStep {
        let source = self.describe(&state);
        let process = scope.process().id().clone();
        tracing::debug!(%process, %source, error = %cause, "escalation raised");
        self.emit(FlowEvent::Escalated {
            process: process.clone(),
            thread: scope.id(),
            source,
            error: cause.to_string(),
        });

        let thread = Arc::clone(&state.thread);
        let control = Arc::clone(&state.control);
        let mut then = state.then.take();

        let owner = match state.work {
            Work::Function { function, unit } => Some((function, unit)),
            Work::Duty { function, unit, .. } => {
                // The administered function follows its duty; it does not run.
                if let Some(function_state) = then.take() {
                    then = function_state.then;
                }
                Some((function, unit))
            }
            _ => None,
        };
        drop(state);

        if let Some((function, unit)) = owner {
            self.unload_unit(scope, unit, ReleaseCause::Escalated);
            let def = &self.functions[function.0];
            if let Some(handler) = def.escalations.find(&cause) {
                self.handled(&process, handler);
                return ContinuationStep::Next(FunctionState::new(
                    thread,
                    control,
                    Work::Function {
                        function: handler,
                        unit: scope.process().next_work_unit(),
                    },
                    Some(object(cause)),
                    then,
                ));
            }
        }

        while let Some(next) = then {
            let mut next = *next;
            if let Work::Callback { spawned: false, .. } = next.work {
                next.work = Work::Callback {
                    outcome: Some(cause),
                    spawned: false,
                };
                return ContinuationStep::Next(next);
            }
            if let Some(unit) = next.work_unit() {
                self.unload_unit(scope, unit, ReleaseCause::Escalated);
            }
            then = next.then.take();
        }

        self.escalate_thread(scope, &thread, &control, cause)
    }

    /// Handles an escalation that left every chain of the thread.
    fn escalate_thread(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        thread: &Thread,
        control: &Arc<ProcessControl>,
        cause: Escalation,
    ) -> ContinuationStep {
        let book = book(scope);
        let active = book.governance.active();
        if !active.is_empty() {
            let raise = FunctionState::new(
                Arc::clone(thread),
                Arc::clone(control),
                Work::Raise(cause),
                None,
                None,
            );
            let actions = active
                .into_iter()
                .map(|governance| (governance, GovernanceAction::Disregard))
                .collect();
            return ContinuationStep::from_chain(governance_chain(
                thread,
                control,
                actions,
                Some(Box::new(raise)),
            ));
        }

        if book.origin.is_some() {
            book.escalated = Some(cause);
            return ContinuationStep::Terminal;
        }

        if !book.handling
            && let Some(handler) = self.process_escalations.find(&cause)
        {
            book.handling = true;
            let process = scope.process();
            self.handled(process.id(), handler);
            return ContinuationStep::Next(FunctionState::new(
                Arc::clone(thread),
                Arc::clone(control),
                Work::Function {
                    function: handler,
                    unit: process.next_work_unit(),
                },
                Some(object(cause)),
                None,
            ));
        }

        self.fail_process(scope, thread, control, cause);
        ContinuationStep::Terminal
    }

    fn handled(&self, process: &ProcessId, handler: FunctionId) {
        let handler = self.functions[handler.0].name.clone();
        tracing::debug!(%process, %handler, "escalation handled");
        self.emit(FlowEvent::EscalationHandled {
            process: process.clone(),
            handler,
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Thread and process endings
    // ─────────────────────────────────────────────────────────────────────────

    /// The thread's main chain has nothing left. Returns the wind-down
    /// chain if there is one, otherwise finishes the thread.
    fn chain_end(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        thread: &Thread,
        control: &Arc<ProcessControl>,
    ) -> Option<FunctionState> {
        let book = book(scope);
        if book.finished {
            return None;
        }
        if book.pending_callbacks > 0 {
            book.idle = true;
            return None;
        }
        if let Some(cause) = book.deferred.take() {
            return Some(FunctionState::new(
                Arc::clone(thread),
                Arc::clone(control),
                Work::Raise(cause),
                None,
                None,
            ));
        }

        let active = book.governance.active();
        if !control.is_failed() && !active.is_empty() {
            let action = if book.escalated.is_some() {
                GovernanceAction::Disregard
            } else {
                GovernanceAction::Enforce
            };
            let actions = active.into_iter().map(|governance| (governance, action)).collect();
            return governance_chain(thread, control, actions, None).map(|chain| *chain);
        }

        let escalated = book.escalated.take();
        self.finish_thread(scope, control, escalated);
        None
    }

    /// Drops a state of a failed process, or one arriving after its thread
    /// finished, and winds the thread down once nothing else is pending.
    fn discard(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        thread: &Thread,
        control: &Arc<ProcessControl>,
        state: FunctionState,
    ) {
        let book = book(scope);
        if book.finished {
            return;
        }
        if let Work::Callback { spawned: true, .. } = state.work {
            book.pending_callbacks = book.pending_callbacks.saturating_sub(1);
            if !book.idle || book.pending_callbacks > 0 {
                return;
            }
            book.idle = false;
        }
        drop(state);
        if let Some(next) = self.chain_end(scope, thread, control) {
            self.discard(scope, thread, control, next);
        }
    }

    fn fail_process(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        thread: &Thread,
        control: &Arc<ProcessControl>,
        cause: Escalation,
    ) {
        if control.fail(cause.clone()) {
            let process = Arc::clone(scope.process());
            tracing::error!(process = %process.id(), thread = %thread.id(), error = %cause, "process failed");
            self.emit(FlowEvent::ProcessFailed {
                process: process.id().clone(),
                error: cause.to_string(),
            });
            process.abandon();
        }
        self.finish_thread(scope, control, Some(cause));
    }

    /// Unloads the thread and reports its end to its origin and the process.
    fn finish_thread(
        self: &Arc<Self>,
        scope: &mut ThreadScope<FunctionState>,
        control: &Arc<ProcessControl>,
        cause: Option<Escalation>,
    ) {
        let thread_book = book(scope);
        if thread_book.finished {
            return;
        }
        thread_book.finished = true;
        let origin = thread_book.origin.take();
        let leftover = thread_book.governance.drain();

        for (index, entry) in leftover.into_iter().filter(|(_, entry)| entry.active) {
            if let Some(def) = self.governances.get(index.0)
                && let Err(error) = def
                    .governance
                    .disregard(&GovernanceContext::new(&def.name, &entry.objects))
            {
                tracing::warn!(governance = %def.name, %error, "disregard failed during teardown");
            }
        }

        let release = if cause.is_some() || control.is_failed() {
            ReleaseCause::Escalated
        } else {
            ReleaseCause::Completed
        };
        scope.unload(release);
        book(scope).asyncs.clear();

        let process = Arc::clone(scope.process());
        tracing::debug!(process = %process.id(), thread = %scope.id(), ?release, "thread complete");
        self.emit(FlowEvent::ThreadComplete {
            process: process.id().clone(),
            thread: scope.id(),
        });

        if let Some(ThreadOrigin { parent, callback }) = origin {
            let report = FunctionState::new(
                parent,
                Arc::clone(control),
                Work::Callback {
                    outcome: cause,
                    spawned: true,
                },
                None,
                None,
            )
            .with_callback(callback);
            self.schedule(report);
        }

        if process.thread_ended() {
            let release = if control.is_failed() {
                ReleaseCause::Escalated
            } else {
                ReleaseCause::Completed
            };
            process.end(release);
            if control.complete() {
                tracing::info!(process = %process.id(), "process completed");
                self.emit(FlowEvent::ProcessComplete {
                    process: process.id().clone(),
                });
            }
        }
    }
}

/// Runs `duty` for the function `state` is, then resumes `state`.
fn duty_state(state: FunctionState, function: FunctionId, unit: WorkUnitId, duty: DutyId) -> FunctionState {
    FunctionState::new(
        Arc::clone(&state.thread),
        Arc::clone(&state.control),
        Work::Duty {
            function,
            unit,
            duty,
        },
        None,
        Some(Box::new(state)),
    )
}

/// Prepends one governance step per action to `tail`.
fn governance_chain(
    thread: &Thread,
    control: &Arc<ProcessControl>,
    actions: Vec<(GovernanceIndex, GovernanceAction)>,
    tail: Option<Box<FunctionState>>,
) -> Option<Box<FunctionState>> {
    actions.into_iter().rev().fold(tail, |then, (governance, action)| {
        Some(Box::new(FunctionState::new(
            Arc::clone(thread),
            Arc::clone(control),
            Work::Governance { governance, action },
            None,
            then,
        )))
    })
}
