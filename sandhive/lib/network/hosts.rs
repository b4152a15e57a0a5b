//! Read-modify-write edits of a hosts file.
//!
//! Edits are pure functions over the file contents; [`add_hosts_entry`] and
//! [`remove_hosts_entry`] apply them under a process-wide lock.

use std::{
    fs::OpenOptions,
    io::Write,
    net::Ipv4Addr,
    path::Path,
    sync::{LazyLock, Mutex},
};

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static HOSTS_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `contents` with `hostname` published at `ip`, replacing earlier lines for it.
pub fn with_entry(contents: &str, ip: Ipv4Addr, hostname: &str) -> String {
    let mut out = without_entry(contents, hostname);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("{ip}\t{hostname}\n"));
    out
}

/// Returns `contents` without any line naming `hostname`.
pub fn without_entry(contents: &str, hostname: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        if names_host(line, hostname) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Whether any line of `contents` names `hostname`.
pub fn has_entry(contents: &str, hostname: &str) -> bool {
    contents.lines().any(|line| names_host(line, hostname))
}

/// Publishes `hostname` at `ip` in the hosts file at `path`.
pub fn add_hosts_entry(path: &Path, ip: Ipv4Addr, hostname: &str) -> SandhiveResult<()> {
    edit(path, |contents| with_entry(contents, ip, hostname))
}

/// Removes `hostname` from the hosts file at `path`. Missing entries are fine.
pub fn remove_hosts_entry(path: &Path, hostname: &str) -> SandhiveResult<()> {
    edit(path, |contents| without_entry(contents, hostname))
}

fn edit(path: &Path, change: impl FnOnce(&str) -> String) -> SandhiveResult<()> {
    let _guard = HOSTS_LOCK
        .lock()
        .map_err(|e| SandhiveError::custom(anyhow::anyhow!("hosts lock poisoned: {e}")))?;

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let updated = change(&contents);
    if updated == contents {
        return Ok(());
    }

    // Rewritten in place: /etc/hosts is often a bind mount that cannot be renamed over.
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(updated.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn names_host(line: &str, hostname: &str) -> bool {
    let line = line.split('#').next().unwrap_or_default();
    line.split_whitespace().skip(1).any(|name| name == hostname)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
