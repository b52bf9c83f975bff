//! Mounting and unmounting the composed overlay.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use stein_common::{SteinError, SteinResult};

use super::{Filesystem, SYSTEMD_PATH};

/// Prefix of the randomly named mountpoint under `/tmp`.
const TARGET_PREFIX: &str = "/tmp/stein.";

impl Filesystem {
    /// Mount the overlay read-write at a fresh random target.
    ///
    /// The top layer becomes the upperdir; the enabled remaining layers are
    /// stacked beneath it in order. A no-op when already mounted. Missing
    /// layer directories are created with mode `0755`.
    pub fn mount(&self) -> SteinResult<()> {
        self.mount_with(false)
    }

    /// Mount the overlay read-only.
    ///
    /// The top layer is prepended to the lower list instead of acting as an
    /// upperdir, so no workdir is needed and no layer is written to.
    pub fn mount_read_only(&self) -> SteinResult<()> {
        self.mount_with(true)
    }

    fn mount_with(&self, read_only: bool) -> SteinResult<()> {
        let mut st = self.state.write();
        if st.mounted {
            return Ok(());
        }

        create_dir_0755(&self.base).map_err(mount_error)?;
        create_dir_0755(&self.top_layer_dir()).map_err(mount_error)?;
        for (i, name) in self.layers.iter().enumerate() {
            if i != 0 && st.mask[i] {
                create_dir_0755(&self.base.join(name)).map_err(mount_error)?;
            }
        }

        let target = PathBuf::from(format!("{TARGET_PREFIX}{}", random_token()));
        create_dir_0755(&target).map_err(mount_error)?;
        if !read_only {
            create_dir_0755(&self.work_dir()).map_err(mount_error)?;
        }

        let options = self.compose_options(&st.mask, read_only);
        tracing::debug!(
            target = %target.display(),
            options = %options,
            read_only,
            "mounting overlay"
        );

        let options_c = CString::new(options).map_err(|e| SteinError::Mount {
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        rustix::mount::mount(
            "overlay",
            &target,
            c"overlay",
            rustix::mount::MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| mount_error(e.into()))?;

        st.mounted = true;
        st.target = Some(target);
        Ok(())
    }

    /// Unmount the overlay and clean up the mountpoint and workdir.
    ///
    /// A no-op when not mounted. Once the kernel has released the mount the
    /// handle is considered unmounted even if the directory cleanup fails;
    /// the cleanup error is still surfaced.
    pub fn unmount(&self) -> SteinResult<()> {
        let mut st = self.state.write();
        if !st.mounted {
            return Ok(());
        }
        let target = st
            .target
            .clone()
            .expect("mounted filesystem must have a target");

        rustix::mount::unmount(&target, rustix::mount::UnmountFlags::empty())
            .map_err(|e| unmount_error(e.into()))?;
        st.mounted = false;
        st.target = None;

        tracing::debug!(target = %target.display(), "overlay unmounted");

        let workdir_result = match fs::remove_dir_all(self.work_dir()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        let target_result = fs::remove_dir(&target);
        workdir_result.map_err(unmount_error)?;
        target_result.map_err(unmount_error)?;
        Ok(())
    }

    /// Whether the mounted tree can be booted.
    ///
    /// True iff the overlay is mounted and the tree carries the init binary
    /// at `usr/lib/systemd/systemd`. Probes the filesystem on every call.
    pub fn is_bootable(&self) -> bool {
        let st = self.state.read();
        if !st.mounted {
            return false;
        }
        match &st.target {
            Some(target) => target.join(SYSTEMD_PATH).symlink_metadata().is_ok(),
            None => false,
        }
    }

    /// Enable every layer. Takes effect at the next mount.
    pub fn enable_all(&self) {
        self.state.write().mask.fill(true);
    }

    /// Disable every layer except the top, which is always mounted.
    /// Takes effect at the next mount.
    pub fn disable_all(&self) {
        self.state.write().mask.fill(false);
    }

    /// Enable the named layers. Takes effect at the next mount.
    pub fn enable(&self, shorts: &[&str]) -> SteinResult<()> {
        self.set_mask(shorts, true)
    }

    /// Disable the named layers. Takes effect at the next mount. Disabling
    /// the top layer has no effect: it is always the upperdir.
    pub fn disable(&self, shorts: &[&str]) -> SteinResult<()> {
        self.set_mask(shorts, false)
    }

    fn set_mask(&self, shorts: &[&str], enabled: bool) -> SteinResult<()> {
        let mut st = self.state.write();
        for short in shorts {
            let index = self.layers.index_of(short)?;
            st.mask[index] = enabled;
        }
        Ok(())
    }

    /// The kernel option string the next mount would use.
    #[must_use]
    pub fn mount_options(&self, read_only: bool) -> String {
        let st = self.state.read();
        self.compose_options(&st.mask, read_only)
    }

    fn compose_options(&self, mask: &[bool], read_only: bool) -> String {
        let mut lowers: Vec<PathBuf> = Vec::new();
        if read_only {
            lowers.push(self.top_layer_dir());
        }
        for (i, name) in self.layers.iter().enumerate() {
            if i != 0 && mask[i] {
                lowers.push(self.base.join(name));
            }
        }
        let lowerdir = lowers
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        if read_only {
            format!("lowerdir={lowerdir}")
        } else {
            format!(
                "lowerdir={lowerdir},upperdir={},workdir={}",
                self.top_layer_dir().display(),
                self.work_dir().display()
            )
        }
    }
}

/// 8 random bytes, base64url without padding.
fn random_token() -> String {
    let bytes = *uuid::Uuid::new_v4().as_bytes();
    URL_SAFE_NO_PAD.encode(&bytes[..8])
}

fn create_dir_0755(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o755);
    match builder.create(path) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}

fn mount_error(source: io::Error) -> SteinError {
    SteinError::Mount { source }
}

fn unmount_error(source: io::Error) -> SteinError {
    SteinError::Unmount { source }
}

#[cfg(test)]
impl Filesystem {
    /// Mark the handle as mounted at `target` without touching the kernel.
    pub(crate) fn pretend_mounted(&self, target: &Path) {
        let mut st = self.state.write();
        st.mounted = true;
        st.target = Some(target.to_path_buf());
    }

    pub(crate) fn pretend_unmounted(&self) {
        let mut st = self.state.write();
        st.mounted = false;
        st.target = None;
    }
}
