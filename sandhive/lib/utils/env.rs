use std::{env, path::PathBuf};

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the host node id.
pub const SANDHIVE_NODE_ID_ENV_VAR: &str = "SANDHIVE_NODE_ID";

/// Environment variable for the template envs root.
pub const SANDHIVE_ENVS_DISK_ENV_VAR: &str = "SANDHIVE_ENVS_DISK";

/// Environment variable for the directory holding Firecracker API sockets.
pub const SANDHIVE_RUNTIME_DIR_ENV_VAR: &str = "SANDHIVE_RUNTIME_DIR";

/// Environment variable for the directory holding the task database.
pub const SANDHIVE_STATE_DIR_ENV_VAR: &str = "SANDHIVE_STATE_DIR";

/// Environment variable for the logs proxy address pushed to guests.
pub const SANDHIVE_LOGS_PROXY_ADDRESS_ENV_VAR: &str = "SANDHIVE_LOGS_PROXY_ADDRESS";

/// Environment variable for the Consul HTTP address.
pub const CONSUL_HTTP_ADDR_ENV_VAR: &str = "CONSUL_HTTP_ADDR";

/// Environment variable for the Consul ACL token.
pub const CONSUL_TOKEN_ENV_VAR: &str = "CONSUL_TOKEN";

/// Environment variable for the firecracker binary.
pub const SANDHIVE_FIRECRACKER_EXE_ENV_VAR: &str = "SANDHIVE_FIRECRACKER_EXE";

/// Environment variable for the tenant catalog file.
pub const SANDHIVE_CATALOG_ENV_VAR: &str = "SANDHIVE_CATALOG";

/// Environment variable for the shared secret of the build-logs channel.
pub const SANDHIVE_BUILD_API_SECRET_ENV_VAR: &str = "SANDHIVE_BUILD_API_SECRET";

/// Environment variable for the HTTP port.
pub const SANDHIVE_PORT_ENV_VAR: &str = "SANDHIVE_PORT";

/// Environment variable for the hosts file.
pub const SANDHIVE_HOSTS_FILE_ENV_VAR: &str = "SANDHIVE_HOSTS_FILE";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the value of a required environment variable.
pub fn require_env(name: &str) -> SandhiveResult<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(SandhiveError::InvalidConfig(format!("{name} is not set"))),
    }
}

/// Returns the value of an environment variable, or `default` when unset or empty.
pub fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Returns an environment variable as a path, or `default` when unset.
pub fn env_path_or(name: &str, default: &PathBuf) -> PathBuf {
    env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| default.clone())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_require_env_rejects_blank_values() {
        env::set_var("SANDHIVE_TEST_REQUIRED", "  ");
        assert!(matches!(
            require_env("SANDHIVE_TEST_REQUIRED"),
            Err(SandhiveError::InvalidConfig(_))
        ));

        env::set_var("SANDHIVE_TEST_REQUIRED", "node-1");
        assert_eq!(require_env("SANDHIVE_TEST_REQUIRED").unwrap(), "node-1");
        env::remove_var("SANDHIVE_TEST_REQUIRED");
    }

    #[test]
    #[serial]
    fn test_env_or_uses_default() {
        env::remove_var("SANDHIVE_TEST_OPTIONAL");
        assert_eq!(env_or("SANDHIVE_TEST_OPTIONAL", "fallback"), "fallback");
    }
}
