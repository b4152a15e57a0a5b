//! The per-node task driver.
//!
//! One task is one sandbox. The driver starts tasks through the instance assembler, watches their
//! VMMs and persists a recovery record per task. Tasks never survive a driver restart: their
//! records are only used to reclaim what the previous process left behind.

mod driver;
mod store;
mod task;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use driver::*;
pub use store::*;
pub use task::*;
