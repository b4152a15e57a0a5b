use std::path::PathBuf;

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{
    utils::{self, TASKS_DB_FILENAME},
    SandhiveError, SandhiveResult,
};

use super::{
    DEFAULT_CONSUL_ADDR, DEFAULT_ENVS_DISK, DEFAULT_FIRECRACKER_BINARY, DEFAULT_HOSTS_FILE,
    DEFAULT_RUNTIME_DIR, DEFAULT_SERVER_PORT, DEFAULT_STATE_DIR,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings of one worker node.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NodeConfig {
    /// The host node id.
    #[builder(setter(into))]
    node_id: String,

    /// Root directory of the template envs.
    #[builder(default = DEFAULT_ENVS_DISK.clone(), setter(into))]
    envs_root: PathBuf,

    /// Directory holding Firecracker API sockets.
    #[builder(default = DEFAULT_RUNTIME_DIR.clone(), setter(into))]
    runtime_dir: PathBuf,

    /// Directory holding the task database.
    #[builder(default = DEFAULT_STATE_DIR.clone(), setter(into))]
    state_dir: PathBuf,

    /// Address of the logs proxy, handed to guests through MMDS.
    #[builder(default, setter(into))]
    logs_proxy_address: String,

    /// Consul HTTP address.
    #[builder(default = DEFAULT_CONSUL_ADDR.to_string(), setter(into))]
    consul_addr: String,

    /// Consul ACL token.
    #[builder(default, setter(strip_option, into))]
    consul_token: Option<String>,

    /// Path to the firecracker binary.
    #[builder(default = PathBuf::from(DEFAULT_FIRECRACKER_BINARY), setter(into))]
    firecracker_exe: PathBuf,

    /// Path to the tenant catalog.
    #[builder(default, setter(strip_option, into))]
    catalog_path: Option<PathBuf>,

    /// Shared secret expected on the build-logs channel.
    #[builder(default, setter(strip_option, into))]
    build_api_secret: Option<String>,

    /// HTTP port.
    #[builder(default = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Hosts file sandbox names are published to.
    #[builder(default = DEFAULT_HOSTS_FILE.clone(), setter(into))]
    hosts_file: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeConfig {
    /// Loads the node configuration from the environment, honouring a `.env` file.
    pub fn from_env() -> SandhiveResult<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("loaded environment from {}", path.display());
        }

        let port = match std::env::var(utils::SANDHIVE_PORT_ENV_VAR) {
            Ok(raw) => raw.parse::<u16>().map_err(|e| {
                SandhiveError::InvalidConfig(format!(
                    "{} is not a valid port: {e}",
                    utils::SANDHIVE_PORT_ENV_VAR
                ))
            })?,
            Err(_) => DEFAULT_SERVER_PORT,
        };

        let firecracker_exe = hiveutils::resolve_binary(
            utils::SANDHIVE_FIRECRACKER_EXE_ENV_VAR,
            DEFAULT_FIRECRACKER_BINARY,
        )
        .unwrap_or_else(|e| {
            tracing::warn!("firecracker binary not resolved, relying on PATH at spawn: {e}");
            PathBuf::from(DEFAULT_FIRECRACKER_BINARY)
        });

        Ok(Self {
            node_id: utils::require_env(utils::SANDHIVE_NODE_ID_ENV_VAR)?,
            envs_root: utils::env_path_or(utils::SANDHIVE_ENVS_DISK_ENV_VAR, &DEFAULT_ENVS_DISK),
            runtime_dir: utils::env_path_or(
                utils::SANDHIVE_RUNTIME_DIR_ENV_VAR,
                &DEFAULT_RUNTIME_DIR,
            ),
            state_dir: utils::env_path_or(utils::SANDHIVE_STATE_DIR_ENV_VAR, &DEFAULT_STATE_DIR),
            logs_proxy_address: utils::env_or(utils::SANDHIVE_LOGS_PROXY_ADDRESS_ENV_VAR, ""),
            consul_addr: utils::env_or(utils::CONSUL_HTTP_ADDR_ENV_VAR, DEFAULT_CONSUL_ADDR),
            consul_token: std::env::var(utils::CONSUL_TOKEN_ENV_VAR).ok(),
            firecracker_exe,
            catalog_path: std::env::var_os(utils::SANDHIVE_CATALOG_ENV_VAR).map(PathBuf::from),
            build_api_secret: std::env::var(utils::SANDHIVE_BUILD_API_SECRET_ENV_VAR).ok(),
            port,
            hosts_file: utils::env_path_or(utils::SANDHIVE_HOSTS_FILE_ENV_VAR, &DEFAULT_HOSTS_FILE),
        })
    }

    /// The node id prefix used as client id and KV prefix.
    pub fn short_node_id(&self) -> String {
        utils::short_node_id(&self.node_id)
    }

    /// Path of the task database.
    pub fn tasks_db_path(&self) -> PathBuf {
        self.state_dir.join(TASKS_DB_FILENAME)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = NodeConfig::builder().node_id("0123456789").build();
        assert_eq!(config.short_node_id(), "01234567");
        assert_eq!(config.get_port(), &DEFAULT_SERVER_PORT);
        assert_eq!(config.get_envs_root(), &*DEFAULT_ENVS_DISK);
        assert_eq!(
            config.tasks_db_path(),
            DEFAULT_STATE_DIR.join(TASKS_DB_FILENAME)
        );
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() -> anyhow::Result<()> {
        std::env::set_var(utils::SANDHIVE_NODE_ID_ENV_VAR, "nodeabcdef99");
        std::env::set_var(utils::SANDHIVE_PORT_ENV_VAR, "4100");
        std::env::set_var(utils::SANDHIVE_RUNTIME_DIR_ENV_VAR, "/tmp/sh");

        let config = NodeConfig::from_env()?;
        assert_eq!(config.get_node_id(), "nodeabcdef99");
        assert_eq!(config.get_port(), &4100);
        assert_eq!(config.get_runtime_dir(), &PathBuf::from("/tmp/sh"));

        std::env::set_var(utils::SANDHIVE_PORT_ENV_VAR, "not-a-port");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(SandhiveError::InvalidConfig(_))
        ));

        std::env::remove_var(utils::SANDHIVE_NODE_ID_ENV_VAR);
        std::env::remove_var(utils::SANDHIVE_PORT_ENV_VAR);
        std::env::remove_var(utils::SANDHIVE_RUNTIME_DIR_ENV_VAR);
        Ok(())
    }
}
