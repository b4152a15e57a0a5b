//! `hiveutils::path` is a module containing path utilities for the sandhive project.

use std::path::{Path, PathBuf};

use crate::{HiveutilsError, HiveutilsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves the path of an executable from an environment variable, falling back to a default path.
///
/// The environment variable takes precedence. Whichever candidate is chosen must exist on disk,
/// otherwise [`HiveutilsError::BinaryNotFound`] is returned naming the candidate and where it came
/// from.
///
/// ## Arguments
///
/// * `env_var` - The environment variable that may override the path
/// * `default_path` - The path used when the variable is not set
pub fn resolve_env_path(env_var: &str, default_path: impl AsRef<Path>) -> HiveutilsResult<PathBuf> {
    let (path, source) = std::env::var(env_var)
        .map(|p| (PathBuf::from(p), format!("environment variable {env_var}")))
        .unwrap_or_else(|_| {
            (
                default_path.as_ref().to_path_buf(),
                "default path".to_string(),
            )
        });

    if !path.exists() {
        return Err(HiveutilsError::BinaryNotFound(
            path.display().to_string(),
            source,
        ));
    }

    Ok(path)
}

/// Resolves the path of an executable from an environment variable, falling back to a `PATH` lookup.
///
/// ## Arguments
///
/// * `env_var` - The environment variable that may override the lookup
/// * `binary_name` - The executable name searched for in `PATH`
pub fn resolve_binary(env_var: &str, binary_name: &str) -> HiveutilsResult<PathBuf> {
    if let Ok(path) = std::env::var(env_var) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(HiveutilsError::BinaryNotFound(
                path.display().to_string(),
                format!("environment variable {env_var}"),
            ));
        }
        return Ok(path);
    }

    which::which(binary_name).map_err(|e| {
        HiveutilsError::BinaryNotFound(binary_name.to_string(), format!("PATH lookup: {e}"))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_resolve_env_path_prefers_env_var() -> anyhow::Result<()> {
        let temp = tempfile::NamedTempFile::new()?;
        std::env::set_var("HIVEUTILS_TEST_BIN", temp.path());

        let resolved = resolve_env_path("HIVEUTILS_TEST_BIN", "/does/not/exist")?;
        assert_eq!(resolved, temp.path());

        std::env::remove_var("HIVEUTILS_TEST_BIN");
        Ok(())
    }

    #[test]
    #[serial]
    fn test_resolve_env_path_falls_back_to_default() -> anyhow::Result<()> {
        std::env::remove_var("HIVEUTILS_TEST_BIN");
        let temp = tempfile::NamedTempFile::new()?;

        let resolved = resolve_env_path("HIVEUTILS_TEST_BIN", temp.path())?;
        assert_eq!(resolved, temp.path());

        let missing = resolve_env_path("HIVEUTILS_TEST_BIN", "/does/not/exist");
        assert!(matches!(missing, Err(HiveutilsError::BinaryNotFound(..))));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_resolve_binary_reports_missing_override() {
        std::env::set_var("HIVEUTILS_TEST_BIN", "/does/not/exist");
        let result = resolve_binary("HIVEUTILS_TEST_BIN", "sh");
        assert!(matches!(result, Err(HiveutilsError::BinaryNotFound(..))));
        std::env::remove_var("HIVEUTILS_TEST_BIN");
    }
}
