//! Cluster-wide reservation of per-node network slots.

mod allocator;
mod consul;
mod kv;
mod slot;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use allocator::*;
pub use consul::*;
pub use kv::*;
pub use slot::*;
