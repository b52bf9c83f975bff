//! Overlay filesystem handling.
//!
//! This module covers:
//! - the layer stack and its naming scheme
//! - mounting/unmounting the composed overlay
//! - overlay entry classification (whiteouts, opaque markers ride along)
//! - the downward merge that collapses one layer into the one beneath it

mod attrs;
mod entry;
mod layers;
mod merge;
mod overlay;

pub use attrs::copy_attributes;
pub use entry::{OverlayEntry, classify, create_whiteout, is_whiteout};
pub use layers::LayerStack;

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use stein_common::{SteinError, SteinResult};

/// Suffix appended to the top layer directory to form the overlay workdir.
pub const WORK_DIR_SUFFIX: &str = ".work";

/// Path of the init binary, relative to the mounted tree, that makes the
/// tree bootable.
pub const SYSTEMD_PATH: &str = "usr/lib/systemd/systemd";

/// A stack of layer directories mountable as a single overlay tree.
///
/// The handle never deletes layer contents; it only creates and removes the
/// mountpoint and the workdir. Layer masking, mounting and merging all go
/// through it.
#[derive(Debug)]
pub struct Filesystem {
    base: PathBuf,
    layers: LayerStack,
    state: RwLock<MountState>,
}

#[derive(Debug)]
struct MountState {
    mask: Vec<bool>,
    target: Option<PathBuf>,
    mounted: bool,
}

impl Filesystem {
    /// Create a detached handle over `base` and `layers`.
    ///
    /// Nothing is touched on disk until [`mount`](Self::mount). All layers
    /// start enabled.
    pub fn new(base: impl Into<PathBuf>, layers: LayerStack) -> Self {
        let mask = vec![true; layers.len()];
        Self {
            base: base.into(),
            layers,
            state: RwLock::new(MountState {
                mask,
                target: None,
                mounted: false,
            }),
        }
    }

    /// The base directory holding the layer directories.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The layer stack, topmost first.
    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    /// Full path of the top (writable) layer directory.
    pub fn top_layer_dir(&self) -> PathBuf {
        self.base.join(self.layers.top())
    }

    /// Full path of the overlay workdir, the scratch directory the kernel
    /// needs next to the upperdir.
    pub fn work_dir(&self) -> PathBuf {
        let mut name = self.layers.top().to_string();
        name.push_str(WORK_DIR_SUFFIX);
        self.base.join(name)
    }

    /// Full path of the directory of the layer with short name `short`.
    pub fn layer_dir(&self, short: &str) -> SteinResult<PathBuf> {
        Ok(self.base.join(self.layers.dir_name(short)?))
    }

    /// The mountpoint of the composed tree.
    ///
    /// Only populated while mounted; [`SteinError::NotMounted`] otherwise.
    pub fn target_dir(&self) -> SteinResult<PathBuf> {
        self.state.read().target.clone().ok_or(SteinError::NotMounted)
    }

    /// Whether the overlay is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.state.read().mounted
    }
}
