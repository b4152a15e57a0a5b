use std::sync::LazyLock;

use rand::{distr::Alphanumeric, Rng};
use regex::Regex;

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Length of generated sandbox ids.
pub const SANDBOX_ID_LEN: usize = 20;

/// Length of the node id prefix used as client id and KV prefix.
pub const SHORT_NODE_ID_LEN: usize = 8;

/// Sandbox ids end up in paths, hostnames and KV values.
static SANDBOX_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").unwrap()
});

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a new sandbox id made of lowercase letters and digits.
pub fn generate_sandbox_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SANDBOX_ID_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// Fails with [`SandhiveError::InvalidSandbox`] unless `id` is safe to use as a file and host name.
pub fn validate_sandbox_id(id: &str) -> SandhiveResult<()> {
    if SANDBOX_ID_PATTERN.is_match(id) {
        return Ok(());
    }
    Err(SandhiveError::InvalidSandbox(format!(
        "sandbox id {id:?} is not a valid name"
    )))
}

/// Generates a trace id.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Returns the first eight characters of a node id.
pub fn short_node_id(node_id: &str) -> String {
    node_id.chars().take(SHORT_NODE_ID_LEN).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sandbox_id_shape() {
        let id = generate_sandbox_id();
        assert_eq!(id.len(), SANDBOX_ID_LEN);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(id, generate_sandbox_id());
    }

    #[test]
    fn test_validate_sandbox_id() {
        assert!(validate_sandbox_id(&generate_sandbox_id()).is_ok());
        assert!(validate_sandbox_id("s1").is_ok());
        for bad in ["", "../etc", "a/b", "-lead", "with space", "x".repeat(65).as_str()] {
            assert!(
                matches!(validate_sandbox_id(bad), Err(SandhiveError::InvalidSandbox(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_short_node_id() {
        assert_eq!(short_node_id("0123456789abcdef"), "01234567");
        assert_eq!(short_node_id("abc"), "abc");
    }
}
