//! `hiveutils` is a library containing general utilities for the sandhive project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod command;
pub mod error;
pub mod path;
pub mod runtime;
pub mod term;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use error::*;
pub use path::*;
pub use runtime::*;
