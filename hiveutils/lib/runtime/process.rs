use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};

use crate::{HiveutilsError, HiveutilsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sends `sig` to every process in the process group led by `pgid`.
///
/// A group that no longer exists is not an error.
pub fn signal_process_group(pgid: u32, sig: Signal) -> HiveutilsResult<()> {
    let pid = pgid as i32;
    match signal::killpg(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(HiveutilsError::Signal { pid, source }),
    }
}

/// Returns the command line of a process with its arguments joined by spaces.
///
/// `None` when the process does not exist or its command line cannot be read, as for zombies.
pub fn process_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }

    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    Some(args.join(" "))
}

/// Returns whether a process with the given pid currently exists.
pub fn process_exists(pid: u32) -> bool {
    // Signal 0 performs the permission and existence checks without delivering anything.
    !matches!(
        signal::kill(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH)
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exists_for_self() {
        assert!(process_exists(std::process::id()));
    }

    #[tokio::test]
    async fn test_process_cmdline() -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn()?;
        let pid = child.id().expect("child has a pid");

        assert_eq!(process_cmdline(pid).as_deref(), Some("sleep 30"));

        child.kill().await?;
        child.wait().await?;
        assert_eq!(process_cmdline(pid), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_signal_process_group_terminates_children() -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()?;
        let pid = child.id().expect("child has a pid");

        signal_process_group(pid, Signal::SIGKILL)?;
        let status = child.wait().await?;
        assert!(!status.success());

        // The group is gone now; signalling it again is still fine.
        signal_process_group(pid, Signal::SIGKILL)?;
        Ok(())
    }
}
