//! Utility functions and types.

mod env;
mod id;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use env::*;
pub use id::*;
pub use path::*;
