//! Declarative mapping state consumed by the mount planner.

mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use store::*;
