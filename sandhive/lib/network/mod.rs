//! Network namespace construction for sandboxes.
//!
//! Each sandbox gets `ns-{slot}` with a veth pair to the host, a TAP device for the VMM and a
//! 1:1 NAT between the guest's fixed link-local address and the slot's host-visible address.

mod executor;
mod gateway;
pub mod hosts;
mod linux;
mod plan;
mod simulated;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use executor::*;
pub use gateway::*;
pub use linux::*;
pub use plan::*;
pub use simulated::*;
