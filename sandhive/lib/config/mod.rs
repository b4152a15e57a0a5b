//! Configuration types and helpers.

mod catalog;
mod defaults;
mod node;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use catalog::*;
pub use defaults::*;
pub use node::*;
