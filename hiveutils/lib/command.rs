//! `hiveutils::command` runs short-lived external tools and captures their output.

use std::ffi::OsStr;

use tokio::process::Command;

use crate::{HiveutilsError, HiveutilsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `program` with `args` to completion and returns its standard output.
///
/// A non-zero exit status is reported as [`HiveutilsError::CommandFailed`] carrying the trimmed
/// standard error of the process.
pub async fn run_command<I, S>(program: &str, args: I) -> HiveutilsResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    let command_line = render_command_line(program, &args);

    tracing::debug!(command = %command_line, "running command");
    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(HiveutilsError::CommandFailed {
            command: command_line,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn render_command_line(program: &str, args: &[std::ffi::OsString]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_stdout() -> anyhow::Result<()> {
        let out = run_command("sh", ["-c", "echo hello"]).await?;
        assert_eq!(out.trim(), "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_reports_failure() {
        let err = run_command("sh", ["-c", "echo oops >&2; exit 3"])
            .await
            .unwrap_err();

        match err {
            HiveutilsError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(status, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
