//! `sandhive` launches, supervises and tears down Firecracker sandboxes on a worker node.
//!
//! # Overview
//!
//! Every sandbox is a Firecracker microVM restored from a pre-built template snapshot, placed in
//! its own network namespace and exposed on a stable host-visible IP. sandhive handles:
//! - Cluster-wide slot reservation through a compare-and-set KV store
//! - Network namespace construction (veth pair, TAP, NAT, routes, hosts entries)
//! - Copy-on-write rootfs staging
//! - VMM supervision and snapshot restore over the Firecracker API socket
//! - A TTL cache that bounds per-team concurrency and reconciles with running VMMs
//!
//! # Architecture
//!
//! - **Slot**: deterministic naming of every network resource from one index
//! - **Network**: an ordered plan of steps with inverses, executed on a pinned OS thread
//! - **Files**: reflinked rootfs and per-build bind-mount targets
//! - **VMM**: `unshare` + `ip netns exec` + `firecracker`, driven over a UNIX-socket HTTP client
//! - **Instance**: the assembler that composes the above and unwinds on failure
//! - **Driver**: the per-worker task surface (start, wait, stop, destroy, inspect)
//! - **Cache**: the sandbox TTL map, build-status cache and reconciliation loop
//! - **Server**: the HTTP control plane
//!
//! # Modules
//!
//! - [`cache`] - Sandbox and build caches, reconciliation
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Node configuration, defaults and the tenant catalog
//! - [`driver`] - Task driver and recovery records
//! - [`files`] - Per-sandbox filesystem staging
//! - [`instance`] - Sandbox assembly with rollback
//! - [`network`] - Network namespace builder
//! - [`server`] - REST API server implementation
//! - [`slot`] - KV-backed slot allocation
//! - [`utils`] - Common utilities and helpers
//! - [`vmm`] - Firecracker process supervision and API client

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod files;
pub mod instance;
pub mod network;
pub mod server;
pub mod slot;
pub mod utils;
pub mod vmm;

#[cfg(test)]
pub(crate) mod testing;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
