//! Sandbox and build caches.
//!
//! The [`SandboxCache`] is the node's record of which sandboxes exist and how long they may live.
//! It enforces per-team concurrency and maximum lifetimes, and hands every eviction to an
//! [`EvictionHandler`] that destroys the sandbox's task. A [`Reconciler`] periodically resyncs it
//! with the task driver.

mod build;
mod cache;
mod clock;
mod reconcile;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use build::*;
pub use cache::*;
pub use clock::*;
pub use reconcile::*;
pub use sandbox::*;
