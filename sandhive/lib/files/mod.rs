//! Per-sandbox filesystem staging.

mod instance;
mod reflink;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use instance::*;
pub use reflink::*;
