//! The HTTP control plane of a node.
//!
//! Teams authenticate with an API key and manage their sandboxes:
//! - Create, list, inspect and kill sandboxes
//! - Extend or replace sandbox TTLs
//! - Follow template builds pushed by the build service

mod api;
mod data;
mod handlers;
mod service;
mod state;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use data::*;
pub use state::*;
