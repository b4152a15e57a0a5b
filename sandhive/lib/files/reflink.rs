use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// `_IOW(0x94, 9, int)`
const FICLONE: libc::c_ulong = 0x4004_9409;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Produces the per-sandbox copy of a template rootfs.
#[async_trait]
pub trait RootfsCloner: Send + Sync {
    /// Clones `src` to the new file `dst`.
    async fn clone_file(&self, src: &Path, dst: &Path) -> SandhiveResult<()>;
}

/// Clones with the `FICLONE` ioctl, sharing extents until the first write.
///
/// Fails on filesystems without reflink support rather than falling back to a copy.
#[derive(Debug, Clone, Default)]
pub struct ReflinkCloner;

/// Clones with a plain byte copy. Meant for filesystems without reflink support.
#[derive(Debug, Clone, Default)]
pub struct CopyCloner;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    let src_file = File::open(src)?;
    let dst_file = OpenOptions::new().write(true).create_new(true).open(dst)?;

    // SAFETY: both descriptors are valid for the duration of the call.
    let rc = unsafe { libc::ioctl(dst_file.as_raw_fd(), FICLONE as _, src_file.as_raw_fd()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        drop(dst_file);
        let _ = std::fs::remove_file(dst);
        return Err(err);
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RootfsCloner for ReflinkCloner {
    async fn clone_file(&self, src: &Path, dst: &Path) -> SandhiveResult<()> {
        let (src_owned, dst_owned): (PathBuf, PathBuf) = (src.into(), dst.into());
        tokio::task::spawn_blocking(move || reflink(&src_owned, &dst_owned))
            .await?
            .map_err(|e| SandhiveError::ReflinkFailed {
                path: dst.display().to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl RootfsCloner for CopyCloner {
    async fn clone_file(&self, src: &Path, dst: &Path) -> SandhiveResult<()> {
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reflink_leaves_no_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("rootfs.ext4");
        let dst = dir.path().join("clone.ext4");
        std::fs::write(&src, b"template")?;

        // tmpfs and ext4 refuse FICLONE, btrfs and xfs accept it; either way no junk remains.
        match ReflinkCloner.clone_file(&src, &dst).await {
            Ok(()) => assert_eq!(std::fs::read(&dst)?, b"template"),
            Err(SandhiveError::ReflinkFailed { .. }) => assert!(!dst.exists()),
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read(&src)?, b"template");
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_cloner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, b"x")?;

        CopyCloner.clone_file(&src, &dst).await?;
        assert_eq!(std::fs::read(&dst)?, b"x");
        Ok(())
    }
}
