//! Offices: assembly and invocation.
//!
//! An [`OfficeBuilder`] collects resources, teams, governances, duties and
//! functions. [`OfficeBuilder::build`] checks every reference and resolves
//! every load order once; nothing is resolved at run time. The resulting
//! [`Office`] invokes processes.
//!
//! # Example
//!
//! ```
//! use keel_flow::function::FunctionContext;
//! use keel_flow::office::OfficeBuilder;
//! use keel_system::context::ProcessConfig;
//! use keel_system::error::Escalation;
//! use keel_system::resource::{ResourceBinding, ResourceInstance, ResourceScope};
//! use keel_system::source::{source_fn, Sourced};
//!
//! let mut builder = OfficeBuilder::new();
//! let greeting = builder
//!     .bind(
//!         ResourceBinding::new("greeting", ResourceScope::Process)
//!             .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready("hello"))))),
//!     )
//!     .unwrap();
//! builder
//!     .function("greet", move |ctx: &mut FunctionContext<'_>| -> Result<(), Escalation> {
//!         let greeting = ctx.object::<&'static str>(greeting)?;
//!         assert_eq!(*greeting, "hello");
//!         Ok(())
//!     })
//!     .uses(greeting);
//!
//! let office = builder.build().unwrap();
//! let handle = office.invoke_process("greet", None, ProcessConfig::new()).unwrap();
//! assert!(handle.wait().is_completed());
//! ```

use core::error::Error;
use core::fmt;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use keel_system::context::ProcessConfig;
use keel_system::resource::{GovernanceIndex, Object, ResourceBinding, ResourceIndex, ResourceRegistry};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::administration::Duty;
use crate::asset::AssetManager;
use crate::config::OfficeConfig;
use crate::engine::{DutyDef, Engine, FunctionDef, GovernanceDef, TeamEntry};
use crate::error::{AssemblyError, InvokeError};
use crate::escalation::{EscalationRoute, EscalationTable};
use crate::events::{FlowEvent, Observers};
use crate::function::ManagedFunction;
use crate::governance::Governance;
use crate::process::ProcessHandle;
use crate::state::{DutyId, FunctionId, TeamId};
use crate::team::{PassiveTeam, Team};

type RouteMaker = fn(FunctionId) -> EscalationRoute;

struct FunctionSpec {
    name: String,
    function: Arc<dyn ManagedFunction>,
    uses: Vec<ResourceIndex>,
    next: Option<String>,
    team: Option<String>,
    escalations: Vec<(RouteMaker, String)>,
    governed_by: Vec<GovernanceIndex>,
    pre: Vec<String>,
    post: Vec<String>,
}

struct DutySpec {
    name: String,
    duty: Arc<dyn Duty>,
    administers: Vec<ResourceIndex>,
    team: Option<String>,
}

struct GovernanceSpec {
    name: String,
    governance: Arc<dyn Governance>,
    team: Option<String>,
}

/// Collects everything an [`Office`] runs.
#[derive(Default)]
pub struct OfficeBuilder {
    config: OfficeConfig,
    registry: ResourceRegistry,
    teams: Vec<(String, Arc<dyn Team>)>,
    functions: Vec<FunctionSpec>,
    duties: Vec<DutySpec>,
    governances: Vec<GovernanceSpec>,
    process_escalations: Vec<(RouteMaker, String)>,
    observers: Observers,
}

impl OfficeBuilder {
    /// Creates an empty builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OfficeConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OfficeConfig {
        &self.config
    }

    /// Returns the resources bound so far.
    #[must_use]
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Binds a resource.
    ///
    /// # Errors
    ///
    /// Duplicate names, missing instances and out-of-range default instances.
    pub fn bind(&mut self, binding: ResourceBinding) -> Result<ResourceIndex, AssemblyError> {
        Ok(self.registry.bind(binding)?)
    }

    /// Registers a team under `name`.
    pub fn team(&mut self, name: impl Into<String>, team: impl Team) -> &mut Self {
        self.teams.push((name.into(), Arc::new(team)));
        self
    }

    /// Registers a governance and returns a builder for its settings.
    pub fn governance(&mut self, name: impl Into<String>, governance: impl Governance) -> GovernanceBuilder<'_> {
        let index = GovernanceIndex(self.governances.len());
        self.governances.push(GovernanceSpec {
            name: name.into(),
            governance: Arc::new(governance),
            team: None,
        });
        GovernanceBuilder {
            spec: self
                .governances
                .last_mut()
                .expect("governance was just pushed (this is a bug)"),
            index,
        }
    }

    /// Registers a duty and returns a builder for its settings.
    pub fn duty(&mut self, name: impl Into<String>, duty: impl Duty) -> DutyBuilder<'_> {
        self.duties.push(DutySpec {
            name: name.into(),
            duty: Arc::new(duty),
            administers: Vec::new(),
            team: None,
        });
        DutyBuilder {
            spec: self.duties.last_mut().expect("duty was just pushed (this is a bug)"),
        }
    }

    /// Registers a function and returns a builder for its settings.
    pub fn function(&mut self, name: impl Into<String>, function: impl ManagedFunction) -> FunctionBuilder<'_> {
        self.functions.push(FunctionSpec {
            name: name.into(),
            function: Arc::new(function),
            uses: Vec::new(),
            next: None,
            team: None,
            escalations: Vec::new(),
            governed_by: Vec::new(),
            pre: Vec::new(),
            post: Vec::new(),
        });
        FunctionBuilder {
            spec: self
                .functions
                .last_mut()
                .expect("function was just pushed (this is a bug)"),
        }
    }

    /// Routes escalations of type `E` that no function or flow handles to
    /// the function `handler`, which receives the escalation as its argument.
    pub fn process_escalation<E: Error + 'static>(&mut self, handler: impl Into<String>) -> &mut Self {
        self.process_escalations
            .push((EscalationRoute::new::<E>, handler.into()));
        self
    }

    /// Registers an event observer.
    pub fn observe(&mut self, observer: impl Fn(&FlowEvent) + Send + Sync + 'static) -> &mut Self {
        self.observers.add(observer);
        self
    }

    /// Checks every reference and resolves every load order.
    ///
    /// # Errors
    ///
    /// The first [`AssemblyError`] found.
    pub fn build(self) -> Result<Office, AssemblyError> {
        let OfficeBuilder {
            config,
            registry,
            teams: team_specs,
            functions: function_specs,
            duties: duty_specs,
            governances: governance_specs,
            process_escalations,
            observers,
        } = self;

        // Teams
        let mut teams = Vec::with_capacity(team_specs.len() + 1);
        let mut team_names = HashMap::new();
        for (name, team) in team_specs {
            if team_names.insert(name.clone(), TeamId(teams.len())).is_some() {
                return Err(AssemblyError::DuplicateName { kind: "team", name });
            }
            teams.push(TeamEntry { name, team });
        }
        let default_team = match &config.default_team {
            Some(name) => team_names
                .get(name)
                .copied()
                .ok_or_else(|| AssemblyError::UnknownTeam {
                    referenced_by: "office".to_owned(),
                    name: name.clone(),
                })?,
            None => {
                teams.push(TeamEntry {
                    name: "<passive>".to_owned(),
                    team: Arc::new(PassiveTeam),
                });
                TeamId(teams.len() - 1)
            }
        };
        let team_of = |referenced_by: &str, team: &Option<String>| match team {
            Some(name) => team_names
                .get(name)
                .copied()
                .ok_or_else(|| AssemblyError::UnknownTeam {
                    referenced_by: referenced_by.to_owned(),
                    name: name.clone(),
                }),
            None => Ok(default_team),
        };

        // Governances
        let mut governance_names = HashMap::new();
        let mut governances = Vec::with_capacity(governance_specs.len());
        for spec in governance_specs {
            if governance_names.insert(spec.name.clone(), ()).is_some() {
                return Err(AssemblyError::DuplicateName {
                    kind: "governance",
                    name: spec.name,
                });
            }
            let team = team_of(&spec.name, &spec.team)?;
            governances.push(GovernanceDef {
                name: spec.name,
                governance: spec.governance,
                team,
            });
        }

        // Resources
        for bound in registry.iter() {
            for instance in bound.instances() {
                if let Some(&index) = instance
                    .governance()
                    .iter()
                    .find(|index| index.0 >= governances.len())
                {
                    return Err(AssemblyError::UnknownGovernance {
                        referenced_by: bound.name().to_owned(),
                        index,
                    });
                }
            }
        }
        let order: Arc<[ResourceIndex]> = registry.resolve_all()?.into();

        // Names
        let mut names = HashMap::new();
        for (position, spec) in function_specs.iter().enumerate() {
            if names.insert(spec.name.clone(), FunctionId(position)).is_some() {
                return Err(AssemblyError::DuplicateName {
                    kind: "function",
                    name: spec.name.clone(),
                });
            }
        }
        let mut duty_names = HashMap::new();
        for (position, spec) in duty_specs.iter().enumerate() {
            if duty_names.insert(spec.name.clone(), DutyId(position)).is_some() {
                return Err(AssemblyError::DuplicateName {
                    kind: "duty",
                    name: spec.name.clone(),
                });
            }
        }
        let function_named = |referenced_by: &str, name: &str| {
            names
                .get(name)
                .copied()
                .ok_or_else(|| AssemblyError::UnknownFunction {
                    referenced_by: referenced_by.to_owned(),
                    name: name.to_owned(),
                })
        };
        let duty_named = |referenced_by: &str, name: &str| {
            duty_names
                .get(name)
                .copied()
                .ok_or_else(|| AssemblyError::UnknownAdministration {
                    referenced_by: referenced_by.to_owned(),
                    name: name.to_owned(),
                })
        };
        let resolve = |consumer: &str, direct: &[ResourceIndex]| -> Result<Arc<[ResourceIndex]>, AssemblyError> {
            if let Some(&index) = direct.iter().find(|&&index| registry.get(index).is_none()) {
                return Err(AssemblyError::UnknownResource {
                    referenced_by: consumer.to_owned(),
                    index,
                });
            }
            Ok(registry.resolve(consumer, direct)?.into())
        };

        // Duties
        let mut duties = Vec::with_capacity(duty_specs.len());
        for spec in duty_specs {
            let order = resolve(&spec.name, &spec.administers)?;
            let team = team_of(&spec.name, &spec.team)?;
            duties.push(DutyDef {
                name: spec.name,
                duty: spec.duty,
                order,
                team,
            });
        }

        // Functions
        let mut functions = Vec::with_capacity(function_specs.len());
        for spec in function_specs {
            let name = spec.name;
            let order = resolve(&name, &spec.uses)?;
            let next = spec
                .next
                .as_deref()
                .map(|next| function_named(&name, next))
                .transpose()?;
            let team = team_of(&name, &spec.team)?;

            let mut escalations = EscalationTable::default();
            for (route, handler) in &spec.escalations {
                escalations.push(route(function_named(&name, handler)?));
            }
            if let Some(&index) = spec
                .governed_by
                .iter()
                .find(|index| index.0 >= governances.len())
            {
                return Err(AssemblyError::UnknownGovernance {
                    referenced_by: name,
                    index,
                });
            }
            let pre = spec
                .pre
                .iter()
                .map(|duty| duty_named(&name, duty))
                .collect::<Result<Vec<_>, _>>()?;
            let post = spec
                .post
                .iter()
                .map(|duty| duty_named(&name, duty))
                .collect::<Result<Vec<_>, _>>()?;

            tracing::debug!(function = %name, resources = order.len(), "function assembled");
            functions.push(FunctionDef {
                name,
                function: spec.function,
                order,
                next,
                team,
                escalations,
                governance: spec.governed_by,
                pre,
                post,
            });
        }

        let mut handlers = EscalationTable::default();
        for (route, handler) in &process_escalations {
            handlers.push(route(function_named("office", handler)?));
        }

        let assets = Arc::new(AssetManager::new(config.latch_timeout));
        tracing::info!(
            functions = functions.len(),
            duties = duties.len(),
            governances = governances.len(),
            teams = teams.len(),
            "office assembled"
        );
        Ok(Office {
            engine: Arc::new(Engine {
                config,
                registry: Arc::new(registry),
                order,
                functions,
                names,
                duties,
                governances,
                teams,
                default_team,
                process_escalations: handlers,
                observers,
                assets,
            }),
        })
    }
}

impl fmt::Debug for OfficeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("config", &self.config)
            .field("functions", &self.functions.len())
            .field("duties", &self.duties.len())
            .field("governances", &self.governances.len())
            .field("teams", &self.teams.len())
            .finish_non_exhaustive()
    }
}

/// Settings for a function being registered.
pub struct FunctionBuilder<'a> {
    spec: &'a mut FunctionSpec,
}

impl FunctionBuilder<'_> {
    /// Declares a resource the function reads.
    pub fn uses(self, index: ResourceIndex) -> Self {
        if !self.spec.uses.contains(&index) {
            self.spec.uses.push(index);
        }
        self
    }

    /// Names the function that runs after this one.
    pub fn next(self, function: impl Into<String>) -> Self {
        self.spec.next = Some(function.into());
        self
    }

    /// Runs the function on the named team.
    pub fn team(self, team: impl Into<String>) -> Self {
        self.spec.team = Some(team.into());
        self
    }

    /// Routes escalations of type `E` raised by this function to `handler`.
    ///
    /// The handler receives the escalation as its argument and runs in
    /// place of this function's next function.
    pub fn on_escalation<E: Error + 'static>(self, handler: impl Into<String>) -> Self {
        self.spec
            .escalations
            .push((EscalationRoute::new::<E>, handler.into()));
        self
    }

    /// Requires `governance` to be active before the function runs.
    pub fn governed_by(self, governance: GovernanceIndex) -> Self {
        if !self.spec.governed_by.contains(&governance) {
            self.spec.governed_by.push(governance);
        }
        self
    }

    /// Runs the named duty before the function's logic.
    pub fn pre_duty(self, duty: impl Into<String>) -> Self {
        self.spec.pre.push(duty.into());
        self
    }

    /// Runs the named duty after the function's logic.
    pub fn post_duty(self, duty: impl Into<String>) -> Self {
        self.spec.post.push(duty.into());
        self
    }
}

/// Settings for a duty being registered.
pub struct DutyBuilder<'a> {
    spec: &'a mut DutySpec,
}

impl DutyBuilder<'_> {
    /// Declares a resource the duty administers.
    pub fn administers(self, index: ResourceIndex) -> Self {
        if !self.spec.administers.contains(&index) {
            self.spec.administers.push(index);
        }
        self
    }

    /// Runs the duty on the named team.
    pub fn team(self, team: impl Into<String>) -> Self {
        self.spec.team = Some(team.into());
        self
    }
}

/// Settings for a governance being registered.
pub struct GovernanceBuilder<'a> {
    spec: &'a mut GovernanceSpec,
    index: GovernanceIndex,
}

impl GovernanceBuilder<'_> {
    /// Runs the governance's actions on the named team.
    pub fn team(self, team: impl Into<String>) -> Self {
        self.spec.team = Some(team.into());
        self
    }

    /// Returns the index resources and functions refer to it by.
    #[must_use]
    pub fn index(&self) -> GovernanceIndex {
        self.index
    }
}

/// An assembled set of functions, ready to run processes.
///
/// Cheap to share: clones refer to the same office.
#[derive(Clone)]
pub struct Office {
    engine: Arc<Engine>,
}

impl Office {
    /// Starts assembling an office.
    #[must_use]
    pub fn builder() -> OfficeBuilder {
        OfficeBuilder::new()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OfficeConfig {
        &self.engine.config
    }

    /// Returns the resource registry.
    #[must_use]
    pub fn registry(&self) -> &ResourceRegistry {
        &self.engine.registry
    }

    /// Returns `true` if a function is registered under `name`.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.engine.function_id(name).is_some()
    }

    /// Returns the team names, in registration order.
    #[must_use]
    pub fn team_names(&self) -> Vec<&str> {
        self.engine
            .teams
            .iter()
            .map(|entry| entry.name.as_str())
            .collect()
    }

    /// Starts a process at `function`, handing it `argument`.
    ///
    /// # Errors
    ///
    /// [`InvokeError::UnknownFunction`], an invalid `config`, or
    /// [`InvokeError::Closed`] after [`close`](Self::close).
    pub fn invoke_process(
        &self,
        function: &str,
        argument: Option<Object>,
        config: ProcessConfig,
    ) -> Result<ProcessHandle, InvokeError> {
        if self.is_closed() {
            return Err(InvokeError::Closed);
        }
        let id = self
            .engine
            .function_id(function)
            .ok_or_else(|| InvokeError::UnknownFunction(function.to_owned()))?;
        config.validate(&self.engine.registry)?;
        self.engine.invoke(id, argument, config)
    }

    /// Starts a process at `function` with no argument and default settings.
    ///
    /// # Errors
    ///
    /// See [`invoke_process`](Self::invoke_process).
    pub fn invoke(&self, function: &str) -> Result<ProcessHandle, InvokeError> {
        self.invoke_process(function, None, ProcessConfig::new())
    }

    /// Registers an event observer.
    pub fn observe(&self, observer: impl Fn(&FlowEvent) + Send + Sync + 'static) {
        self.engine.observers.add(observer);
    }

    /// Fails latch waiters older than the configured timeout.
    ///
    /// Returns the number of live processes checked.
    pub fn check_timeouts(&self) -> usize {
        self.check_timeouts_at(Instant::now())
    }

    /// Fails latch waiters registered more than the timeout before `now`.
    pub fn check_timeouts_at(&self, now: Instant) -> usize {
        self.engine.assets.check_timeouts(now)
    }

    /// Checks timeouts every configured interval on `runtime`.
    pub fn spawn_timeout_monitor(&self, runtime: &Handle) -> JoinHandle<()> {
        self.engine
            .assets
            .spawn_monitor(self.engine.config.timeout_check_interval, runtime)
    }

    /// Returns the asset manager.
    #[must_use]
    pub fn assets(&self) -> &Arc<AssetManager> {
        &self.engine.assets
    }

    /// Refuses new processes and fails every pending waiter of running ones.
    pub fn close(&self) {
        self.engine.assets.shutdown();
    }

    /// Returns `true` once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.engine.assets.is_shut_down()
    }
}

impl fmt::Debug for Office {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Office")
            .field("functions", &self.engine.functions.len())
            .field("teams", &self.team_names())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionContext;
    use keel_system::error::Escalation;
    use keel_system::resource::{ResourceInstance, ResourceScope};
    use keel_system::source::{Sourced, source_fn};

    fn noop(_: &mut FunctionContext<'_>) -> Result<(), Escalation> {
        Ok(())
    }

    fn constant() -> ResourceInstance {
        ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(1_u8))))
    }

    #[test]
    fn unknown_references_are_reported_with_their_source() {
        let mut builder = OfficeBuilder::new();
        builder.function("a", noop).next("missing");
        assert_eq!(
            builder.build().unwrap_err(),
            AssemblyError::UnknownFunction {
                referenced_by: "a".into(),
                name: "missing".into(),
            }
        );

        let mut builder = OfficeBuilder::new();
        builder.function("a", noop).team("nobody");
        assert!(matches!(
            builder.build(),
            Err(AssemblyError::UnknownTeam { name, .. }) if name == "nobody"
        ));

        let mut builder = OfficeBuilder::new();
        builder.function("a", noop).pre_duty("audit");
        assert!(matches!(
            builder.build(),
            Err(AssemblyError::UnknownAdministration { name, .. }) if name == "audit"
        ));
    }

    #[test]
    fn duplicate_functions_are_rejected() {
        let mut builder = OfficeBuilder::new();
        builder.function("a", noop);
        builder.function("a", noop);
        assert_eq!(
            builder.build().unwrap_err(),
            AssemblyError::DuplicateName {
                kind: "function",
                name: "a".into(),
            }
        );
    }

    #[test]
    fn unbound_uses_are_rejected() {
        let mut builder = OfficeBuilder::new();
        let ghost = ResourceIndex::new(ResourceScope::Thread, 7);
        builder.function("a", noop).uses(ghost);
        assert_eq!(
            builder.build().unwrap_err(),
            AssemblyError::UnknownResource {
                referenced_by: "a".into(),
                index: ghost,
            }
        );
    }

    #[test]
    fn resource_cycles_fail_assembly() {
        let mut builder = OfficeBuilder::new();
        let a = ResourceIndex::new(ResourceScope::Process, 0);
        let b = ResourceIndex::new(ResourceScope::Process, 1);
        builder
            .bind(ResourceBinding::new("a", ResourceScope::Process).with_instance(constant().depends_on(b)))
            .unwrap();
        builder
            .bind(ResourceBinding::new("b", ResourceScope::Process).with_instance(constant().depends_on(a)))
            .unwrap();

        let error = builder.build().unwrap_err();
        assert!(matches!(error, AssemblyError::Cycle(_)));
        assert_eq!(error.to_string(), "cyclic dependency between 'a' and 'b'");
    }

    #[test]
    fn undeclared_governance_on_an_instance_fails_assembly() {
        let mut builder = OfficeBuilder::new();
        builder
            .bind(
                ResourceBinding::new("conn", ResourceScope::Thread)
                    .with_instance(constant().governed_by(GovernanceIndex(3))),
            )
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(AssemblyError::UnknownGovernance { referenced_by, .. }) if referenced_by == "conn"
        ));
    }

    #[test]
    fn default_team_is_passive_unless_named() {
        let office = OfficeBuilder::new().build().unwrap();
        assert_eq!(office.team_names(), vec!["<passive>"]);

        let builder = OfficeBuilder::new().with_config(OfficeConfig::default().with_default_team("workers"));
        assert!(matches!(builder.build(), Err(AssemblyError::UnknownTeam { .. })));
    }

    #[test]
    fn invoking_unknown_functions_or_closed_offices_fails() {
        let mut builder = OfficeBuilder::new();
        builder.function("a", noop);
        let office = builder.build().unwrap();

        assert_eq!(
            office.invoke("b").unwrap_err(),
            InvokeError::UnknownFunction("b".into())
        );
        office.close();
        assert_eq!(office.invoke("a").unwrap_err(), InvokeError::Closed);
    }
}
