//! Resource and execution-context primitives for Keel (Layer 1).
//!
//! `keel_system` provides the pieces every higher layer builds on:
//!
//! - [`resource`] - Resource scopes, indices, bindings and the registry
//! - [`resolver`] - Dependency ordering with cycle detection
//! - [`latch`] - Continuation queues released or failed as a group
//! - [`source`] - The contract resource providers implement
//! - [`container`] - Per-instance resource lifecycle (sourcing, readiness, unload)
//! - [`context`] - Process and thread execution contexts with serialized mutation
//! - [`error`] - Escalations and resource errors
//!
//! # Architecture
//!
//! This crate is Layer 1 of the Keel architecture:
//!
//! - **Layer 1** (`keel_system`): resources, latches and execution contexts (this crate)
//! - **Layer 2** (`keel_flow`): functions, continuation chains, teams and offices
//! - **Telemetry** (`keel_telemetry`): tracing subscriber setup
//!
//! The types here are generic over the continuation type `C` that waits on
//! latches. Layer 2 plugs in its own function state; tests plug in plain
//! values.
//!
//! # Example
//!
//! ```
//! use keel_system::resource::{ResourceBinding, ResourceInstance, ResourceRegistry, ResourceScope};
//! use keel_system::source::{source_fn, Sourced};
//!
//! let mut registry = ResourceRegistry::new();
//! let config = registry
//!     .bind(
//!         ResourceBinding::new("config", ResourceScope::Process)
//!             .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(42_u32))))),
//!     )
//!     .unwrap();
//! let pool = registry
//!     .bind(
//!         ResourceBinding::new("pool", ResourceScope::Process).with_instance(
//!             ResourceInstance::new(source_fn(|_| Ok(Sourced::ready("pool")))).depends_on(config),
//!         ),
//!     )
//!     .unwrap();
//!
//! let order = registry.resolve("main", &[pool]).unwrap();
//! assert_eq!(order, vec![config, pool]);
//! ```

pub mod container;
pub mod context;
pub mod error;
pub mod latch;
pub mod resolver;
pub mod resource;
pub mod source;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::container::*;
    pub use crate::context::*;
    pub use crate::error::*;
    pub use crate::latch::*;
    pub use crate::resolver::*;
    pub use crate::resource::*;
    pub use crate::source::*;
}
