//! Sandbox assembly.
//!
//! An [`Instance`] is a slot, its network, its staged files and a running VMM. The
//! [`InstanceAssembler`] acquires them in that order and releases them in reverse.

mod assembler;
mod instance;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use assembler::*;
pub use instance::*;
