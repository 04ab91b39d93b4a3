//! Overlay-mount planning, file injection, execution and teardown.
//!
//! The planner turns the declarative mapping set into one ordered layer stack
//! per destination, the injector realizes file-level mappings as a synthetic
//! symlink layer, and the executor drives the external overlay-mount utility
//! and keeps the cleanup ledger so every side effect can be reversed.

mod executor;
mod inject;
mod plan;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use executor::*;
pub use inject::*;
pub use plan::*;
