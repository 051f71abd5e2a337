//! Functions, continuation chains, teams and offices for Keel (Layer 2).
//!
//! `keel_flow` runs managed functions over the resources of
//! [`keel_system`]:
//!
//! - [`office`] - Assembling an office and invoking processes
//! - [`function`] - Managed functions, flows and asynchronous operations
//! - [`administration`] - Duties run before and after a function's logic
//! - [`governance`] - Activate/enforce/disregard oversight of resources
//! - [`team`] - Where steps run
//! - [`process`] - Process outcomes and handles
//! - [`asset`] - Latch timeouts and shutdown
//! - [`events`] - Execution events
//! - [`config`] - Office configuration
//! - [`error`] - Assembly, invocation and flow errors
//!
//! # Architecture
//!
//! Every step of a process is a continuation: it loads its resources,
//! suspends on a latch when one is not ready, and is resumed on its team
//! when the latch lets it go. All mutation of a thread's state happens
//! under that thread's exclusive access, so function logic never needs a
//! lock of its own.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use keel_flow::prelude::*;
//! use keel_system::context::ProcessConfig;
//! use keel_system::error::Escalation;
//!
//! let calls = Arc::new(AtomicUsize::new(0));
//! let mut builder = OfficeBuilder::new();
//! let counter = Arc::clone(&calls);
//! builder
//!     .function("first", |_: &mut FunctionContext<'_>| -> Result<(), Escalation> { Ok(()) })
//!     .next("second");
//! builder.function("second", move |_: &mut FunctionContext<'_>| -> Result<(), Escalation> {
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! });
//!
//! let office = builder.build().unwrap();
//! let outcome = office
//!     .invoke_process("first", None, ProcessConfig::new())
//!     .unwrap()
//!     .wait();
//! assert!(outcome.is_completed());
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! ```

pub mod administration;
pub mod asset;
pub mod config;
pub mod error;
pub mod events;
pub mod function;
pub mod governance;
pub mod office;
pub mod process;
pub mod team;

mod engine;
mod escalation;
mod state;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::administration::*;
    pub use crate::asset::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::function::*;
    pub use crate::governance::*;
    pub use crate::office::*;
    pub use crate::process::*;
    pub use crate::team::*;
}
