//! Server state management.

use std::sync::Arc;

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{
    cache::{BuildCache, SandboxCache},
    config::{Catalog, Team},
    driver::TaskDriver,
};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared state of the HTTP control plane.
#[derive(Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ServerState {
    /// Tiers, teams and templates.
    catalog: Arc<Catalog>,

    /// The sandboxes of this node.
    cache: Arc<SandboxCache>,

    /// Build status pushed by the build service.
    #[builder(default = Arc::new(BuildCache::new()))]
    builds: Arc<BuildCache>,

    /// The task driver sandboxes run on.
    driver: Arc<TaskDriver>,

    /// Short id of this node.
    #[builder(setter(into))]
    client_id: String,

    /// Shared secret of the build-logs channel. The channel is closed when unset.
    #[builder(default, setter(into))]
    build_api_secret: Option<String>,
}

/// The team a request was authenticated as.
#[derive(Debug, Clone)]
pub struct AuthenticatedTeam(pub Team);
