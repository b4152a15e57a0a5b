//! `hiveutils::runtime` is a module containing process runtime utilities for the sandhive project.

mod monitor;
mod process;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use monitor::*;
pub use process::*;
