use std::path::{Path, PathBuf};

use getset::Getters;
use tokio::fs;

use crate::{
    utils::{
        self, BUILDS_SUBDIR, BUILD_ID_FILENAME, ENV_INSTANCES_SUBDIR, MEMFILE_FILENAME,
        ROOTFS_FILENAME, SNAPFILE_FILENAME,
    },
    SandhiveError, SandhiveResult,
};

use super::RootfsCloner;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The on-disk layout of one sandbox.
///
/// ```text
/// {envs}/{template_id}/
/// ├── build_id
/// ├── rootfs.ext4, snapfile, memfile       (template, never modified)
/// ├── env-instances/{sandbox_id}/rootfs.ext4
/// └── builds/{build_id}/                   (bind-mount target)
/// {runtime_dir}/fc-{sandbox_id}.sock
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct InstanceFiles {
    /// The sandbox the files belong to.
    sandbox_id: String,

    /// The template directory.
    env_path: PathBuf,

    /// The active build of the template.
    build_id: String,

    /// The directory holding the sandbox's rootfs clone.
    env_instance_path: PathBuf,

    /// The per-build directory the clone is bind-mounted over.
    build_dir_path: PathBuf,

    /// The Firecracker API socket.
    socket_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstanceFiles {
    /// Stages the files of a new sandbox.
    ///
    /// Nothing is created when the template is missing or the socket path is too long. If the
    /// rootfs clone fails, the sandbox directory is removed again.
    pub async fn create(
        cloner: &dyn RootfsCloner,
        envs_root: &Path,
        runtime_dir: &Path,
        template_id: &str,
        sandbox_id: &str,
    ) -> SandhiveResult<Self> {
        let files = Self::locate(envs_root, runtime_dir, template_id, sandbox_id).await?;
        utils::check_socket_path(&files.socket_path)?;

        let template_rootfs = files.env_path.join(ROOTFS_FILENAME);
        for artifact in [&template_rootfs, &files.snapfile_path(), &files.memfile_path()] {
            if !fs::try_exists(artifact).await? {
                return Err(SandhiveError::FilesMissing(artifact.display().to_string()));
            }
        }

        fs::create_dir_all(&files.env_instance_path).await?;
        fs::create_dir_all(&files.build_dir_path).await?;
        fs::create_dir_all(runtime_dir).await?;

        if let Err(e) = cloner
            .clone_file(&template_rootfs, &files.rootfs_path())
            .await
        {
            files.cleanup().await;
            return Err(e);
        }

        tracing::debug!(
            sandbox_id,
            template_id,
            build_id = %files.build_id,
            "staged instance files"
        );
        Ok(files)
    }

    /// Computes the layout of a sandbox without touching anything but the template's `build_id`.
    pub async fn locate(
        envs_root: &Path,
        runtime_dir: &Path,
        template_id: &str,
        sandbox_id: &str,
    ) -> SandhiveResult<Self> {
        let env_path = envs_root.join(template_id);
        let build_id_path = env_path.join(BUILD_ID_FILENAME);
        let build_id = match fs::read_to_string(&build_id_path).await {
            Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
            Ok(_) => {
                return Err(SandhiveError::FilesMissing(format!(
                    "{} is empty",
                    build_id_path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandhiveError::FilesMissing(
                    build_id_path.display().to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            sandbox_id: sandbox_id.to_string(),
            env_instance_path: env_path.join(ENV_INSTANCES_SUBDIR).join(sandbox_id),
            build_dir_path: env_path.join(BUILDS_SUBDIR).join(&build_id),
            socket_path: runtime_dir.join(utils::socket_filename(sandbox_id)),
            env_path,
            build_id,
        })
    }

    /// The sandbox's rootfs clone.
    pub fn rootfs_path(&self) -> PathBuf {
        self.env_instance_path.join(ROOTFS_FILENAME)
    }

    /// The template's VM state snapshot.
    pub fn snapfile_path(&self) -> PathBuf {
        self.env_path.join(SNAPFILE_FILENAME)
    }

    /// The template's guest memory snapshot.
    pub fn memfile_path(&self) -> PathBuf {
        self.env_path.join(MEMFILE_FILENAME)
    }

    /// Removes the sandbox directory and the API socket. Missing files are fine.
    pub async fn cleanup(&self) {
        remove_instance_paths(&self.env_instance_path, &self.socket_path, &self.sandbox_id).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Removes what [`InstanceFiles::create`] made for a sandbox, given only its ids.
///
/// Used when the template's `build_id` may have changed or vanished since the sandbox started.
pub async fn remove_instance_files(
    envs_root: &Path,
    runtime_dir: &Path,
    template_id: &str,
    sandbox_id: &str,
) {
    let instance_dir = envs_root
        .join(template_id)
        .join(ENV_INSTANCES_SUBDIR)
        .join(sandbox_id);
    let socket = runtime_dir.join(utils::socket_filename(sandbox_id));
    remove_instance_paths(&instance_dir, &socket, sandbox_id).await;
}

async fn remove_instance_paths(instance_dir: &Path, socket: &Path, sandbox_id: &str) {
    if let Err(e) = fs::remove_dir_all(instance_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(sandbox_id, "failed to remove {}: {e}", instance_dir.display());
        }
    }

    if let Err(e) = fs::remove_file(socket).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(sandbox_id, "failed to remove {}: {e}", socket.display());
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
