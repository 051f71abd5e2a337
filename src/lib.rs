//! An execution kernel for dependency-ordered resources, serialized execution
//! contexts and continuation chains.
//!
//! ```
//! use keel::prelude::*;
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
//!         tracing::info!(%greeting, "greeted");
//!         Ok(())
//!     })
//!     .uses(greeting);
//!
//! let office = builder.build().unwrap();
//! assert!(office.invoke("greet").unwrap().wait().is_completed());
//! ```

/// Layer 1: resources, latches and execution contexts.
pub use keel_system;

/// Layer 2: functions, continuation chains, teams and offices.
pub use keel_flow;

/// Tracing subscriber setup.
pub use keel_telemetry;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use keel_flow::prelude::*;
    pub use keel_system::prelude::*;
    pub use keel_telemetry::{TracingConfig, TracingFormat, TracingSetup};
}
