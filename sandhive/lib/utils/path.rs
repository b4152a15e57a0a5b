use std::{os::unix::ffi::OsStrExt, path::Path};

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The file in a template directory naming its active build.
pub const BUILD_ID_FILENAME: &str = "build_id";

/// The template root filesystem image.
pub const ROOTFS_FILENAME: &str = "rootfs.ext4";

/// The template VM state snapshot.
pub const SNAPFILE_FILENAME: &str = "snapfile";

/// The template guest memory snapshot.
pub const MEMFILE_FILENAME: &str = "memfile";

/// The sub directory holding per-sandbox rootfs clones.
pub const ENV_INSTANCES_SUBDIR: &str = "env-instances";

/// The sub directory holding per-build bind-mount targets.
pub const BUILDS_SUBDIR: &str = "builds";

/// The task database filename inside the state directory.
pub const TASKS_DB_FILENAME: &str = "tasks.db";

/// Size of `sockaddr_un.sun_path`, including the trailing NUL.
pub const SUN_PATH_LEN: usize = 108;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the API socket path for a sandbox.
pub fn socket_filename(sandbox_id: &str) -> String {
    format!("fc-{sandbox_id}.sock")
}

/// Fails if `path` cannot be bound as a UNIX socket address.
pub fn check_socket_path(path: &Path) -> SandhiveResult<()> {
    let len = path.as_os_str().as_bytes().len();
    let max = SUN_PATH_LEN - 1;
    if len > max {
        return Err(SandhiveError::SocketPathTooLong {
            path: path.display().to_string(),
            len,
            max,
        });
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
