//! Assembly, invocation and flow errors.

use keel_system::context::ProcessConfigError;
use keel_system::resolver::{CycleError, DependencyError};
use keel_system::resource::{GovernanceIndex, ResourceIndex, ResourceScope};

/// A configuration error detected while building an [`Office`](crate::office::Office).
///
/// Assembly stops at the first one found; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    /// Two resources depend on each other.
    #[error("{0}")]
    Cycle(CycleError),
    /// A dependency names an index with nothing bound.
    #[error("'{consumer}' depends on unbound resource {dependency}")]
    UnresolvedDependency {
        /// The resource or function declaring the dependency.
        consumer: String,
        /// The missing index.
        dependency: ResourceIndex,
    },
    /// A name was registered twice.
    #[error("{kind} already registered: {name}")]
    DuplicateName {
        /// What kind of item ("resource", "function", ...).
        kind: &'static str,
        /// The duplicated name.
        name: String,
    },
    /// A resource depends on one with a narrower scope.
    #[error(
        "{consumer_scope} resource '{consumer}' cannot depend on {dependency_scope} resource '{dependency}'"
    )]
    ScopeViolation {
        /// The dependent resource.
        consumer: String,
        /// Its scope.
        consumer_scope: ResourceScope,
        /// The dependency.
        dependency: String,
        /// The dependency's scope.
        dependency_scope: ResourceScope,
    },
    /// A function name could not be found.
    #[error("'{referenced_by}' refers to unknown function '{name}'")]
    UnknownFunction {
        /// Where the reference was made.
        referenced_by: String,
        /// The missing function.
        name: String,
    },
    /// A team name could not be found.
    #[error("'{referenced_by}' refers to unknown team '{name}'")]
    UnknownTeam {
        /// Where the reference was made.
        referenced_by: String,
        /// The missing team.
        name: String,
    },
    /// A function or duty uses an index with nothing bound.
    #[error("'{referenced_by}' uses unbound resource {index}")]
    UnknownResource {
        /// Where the reference was made.
        referenced_by: String,
        /// The missing index.
        index: ResourceIndex,
    },
    /// A governance index was never registered.
    #[error("'{referenced_by}' refers to unknown {index}")]
    UnknownGovernance {
        /// Where the reference was made.
        referenced_by: String,
        /// The missing governance.
        index: GovernanceIndex,
    },
    /// A duty name could not be found.
    #[error("'{referenced_by}' refers to unknown duty '{name}'")]
    UnknownAdministration {
        /// Where the reference was made.
        referenced_by: String,
        /// The missing duty.
        name: String,
    },
    /// A resource's default instance does not exist.
    #[error("default instance {instance} of '{name}' out of range ({available} available)")]
    InvalidDefaultInstance {
        /// Resource name.
        name: String,
        /// Requested default.
        instance: usize,
        /// Number of instances bound.
        available: usize,
    },
    /// A non-input resource was bound without any instance.
    #[error("resource has no instances: {0}")]
    NoInstances(String),
}

impl From<CycleError> for AssemblyError {
    fn from(cycle: CycleError) -> Self {
        AssemblyError::Cycle(cycle)
    }
}

impl From<DependencyError> for AssemblyError {
    fn from(error: DependencyError) -> Self {
        match error {
            DependencyError::Cycle(cycle) => AssemblyError::Cycle(cycle),
            DependencyError::Unresolved {
                consumer,
                dependency,
            } => AssemblyError::UnresolvedDependency {
                consumer,
                dependency,
            },
            DependencyError::ScopeViolation {
                consumer,
                consumer_scope,
                dependency,
                dependency_scope,
            } => AssemblyError::ScopeViolation {
                consumer,
                consumer_scope,
                dependency,
                dependency_scope,
            },
            DependencyError::DuplicateName(name) => AssemblyError::DuplicateName {
                kind: "resource",
                name,
            },
            DependencyError::NoInstances(name) => AssemblyError::NoInstances(name),
            DependencyError::InvalidDefaultInstance {
                name,
                instance,
                available,
            } => AssemblyError::InvalidDefaultInstance {
                name,
                instance,
                available,
            },
        }
    }
}

/// A process could not be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// No function has this name.
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    /// The per-process configuration does not fit the office.
    #[error(transparent)]
    Config(#[from] ProcessConfigError),
    /// The office has been closed.
    #[error("office is closed")]
    Closed,
}

/// Failures raised by the flow layer itself while a process runs.
///
/// These travel as [`Escalation`](keel_system::error::Escalation)s like any
/// other failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// A flow named a function that does not exist.
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    /// The process ran more steps than the office allows.
    #[error("process exceeded the limit of {limit} steps")]
    StepLimitExceeded {
        /// The configured limit.
        limit: usize,
    },
    /// A duty requested an action on a governance that was never registered.
    #[error("unknown {0}")]
    UnknownGovernance(GovernanceIndex),
    /// An asynchronous operation was dropped without reporting an outcome.
    #[error("async operation started by '{function}' was dropped without completing")]
    AsyncDropped {
        /// The function that started it.
        function: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_errors_map_to_assembly_errors() {
        let cycle = CycleError::between("b", "a");
        assert_eq!(
            AssemblyError::from(DependencyError::Cycle(cycle.clone())),
            AssemblyError::Cycle(cycle)
        );
        assert_eq!(
            AssemblyError::from(DependencyError::DuplicateName("db".into())),
            AssemblyError::DuplicateName {
                kind: "resource",
                name: "db".into(),
            }
        );
    }

    #[test]
    fn messages_name_the_offenders() {
        let error = AssemblyError::UnknownFunction {
            referenced_by: "checkout".into(),
            name: "pay".into(),
        };
        assert_eq!(
            error.to_string(),
            "'checkout' refers to unknown function 'pay'"
        );

        let error = AssemblyError::Cycle(CycleError::between("b", "a"));
        assert_eq!(error.to_string(), "cyclic dependency between 'a' and 'b'");
    }
}
