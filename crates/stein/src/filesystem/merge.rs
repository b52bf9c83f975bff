//! Downward merging of overlay layers.
//!
//! `merge` collapses the subtree of an upper layer into a lower layer so
//! that removing the upper layer from the stack afterwards leaves the
//! mounted view unchanged. Entries are moved with `rename`, which is why a
//! directory promotion invalidates the walk in progress: the walk is simply
//! restarted until a pass completes without moving a directory.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use walkdir::WalkDir;

use stein_common::{SteinError, SteinResult};

use super::attrs::copy_attributes;
use super::entry::{OverlayEntry, classify, create_whiteout};
use super::Filesystem;

/// Outcome of one walk pass over the upper subtree.
enum WalkControl {
    Completed,
    /// A directory was renamed out from under the walk; start over.
    Restart,
}

impl Filesystem {
    /// Merge the subtree at `path` of layer `upper` down into layer `lower`.
    ///
    /// `upper` must sit above `lower` in the stack; the layers in between
    /// are consulted (never modified) to keep whiteout semantics intact.
    /// With `exclude_self` the walk root itself is skipped, which is the
    /// usual choice when `path` is the layer root.
    ///
    /// Fails with [`SteinError::AlreadyMounted`] while the overlay is
    /// mounted: the kernel must not watch its layers being rearranged. On
    /// error the layers are left partially merged but remain a valid
    /// overlay; re-running the merge completes the job.
    pub fn merge(
        &self,
        path: impl AsRef<Path>,
        upper: &str,
        lower: &str,
        exclude_self: bool,
    ) -> SteinResult<()> {
        self.merge_counted(path.as_ref(), upper, lower, exclude_self)?;
        Ok(())
    }

    /// The merge loop, returning how many times the walk was restarted.
    pub(crate) fn merge_counted(
        &self,
        path: &Path,
        upper: &str,
        lower: &str,
        exclude_self: bool,
    ) -> SteinResult<u32> {
        if self.is_mounted() {
            return Err(SteinError::AlreadyMounted);
        }
        let uindex = self.layers.index_of(upper)?;
        let lindex = self.layers.index_of(lower)?;
        assert!(
            uindex < lindex,
            "upper layer must sit above the lower layer"
        );

        let uroot = self.base.join(&self.layers[uindex]);
        let lroot = self.base.join(&self.layers[lindex]);
        let rel_path = path.strip_prefix("/").unwrap_or(path);
        let walk_base = uroot.join(rel_path);

        let mut restarts = 0;
        loop {
            // The walk root itself may have been promoted by a previous
            // pass; nothing is left to merge then.
            if classify(&walk_base).map_err(|e| merge_error(&walk_base, e))? == OverlayEntry::Air {
                break;
            }
            match self.merge_walk(&walk_base, &uroot, &lroot, lindex, exclude_self)? {
                WalkControl::Restart => restarts += 1,
                WalkControl::Completed => break,
            }
        }
        tracing::debug!(upper, lower, path = %rel_path.display(), restarts, "merge completed");
        Ok(restarts)
    }

    fn merge_walk(
        &self,
        walk_base: &Path,
        uroot: &Path,
        lroot: &Path,
        lindex: usize,
        exclude_self: bool,
    ) -> SteinResult<WalkControl> {
        for entry in WalkDir::new(walk_base) {
            let entry = entry.map_err(|e| walk_error(walk_base, e))?;
            if exclude_self && entry.depth() == 0 {
                continue;
            }
            let upath = entry.path();
            let rel = upath
                .strip_prefix(uroot)
                .expect("walk stays under the upper root");
            let lpath = lroot.join(rel);

            let umeta = entry.metadata().map_err(|e| walk_error(upath, e))?;
            let utype = OverlayEntry::from_metadata(&umeta);
            let ltype = classify(&lpath).map_err(|e| merge_error(&lpath, e))?;

            match utype {
                OverlayEntry::Directory => match ltype {
                    OverlayEntry::Air => {
                        // The lower layer has no say here: promote the whole
                        // directory in one move.
                        fs::rename(upath, &lpath).map_err(|e| merge_error(upath, e))?;
                        return Ok(WalkControl::Restart);
                    }
                    OverlayEntry::Directory => {
                        copy_attributes(upath, &lpath).map_err(|e| merge_error(&lpath, e))?;
                    }
                    OverlayEntry::File | OverlayEntry::Whiteout => {
                        // The lower entry is a cover; whatever it hides in
                        // still-lower layers must not resurface.
                        if let Some(control) =
                            self.merge_over_cover(upath, &lpath, rel, lindex)?
                        {
                            return Ok(control);
                        }
                    }
                },
                OverlayEntry::File | OverlayEntry::Whiteout => {
                    remove_tree(&lpath).map_err(|e| merge_error(&lpath, e))?;
                    if utype == OverlayEntry::Whiteout && lindex == self.layers.len() - 1 {
                        // The deletion has reached the bottom of the stack:
                        // nothing is left to hide, drop the whiteout itself.
                        fs::remove_file(upath).map_err(|e| merge_error(upath, e))?;
                    } else {
                        fs::rename(upath, &lpath).map_err(|e| merge_error(upath, e))?;
                    }
                }
                OverlayEntry::Air => {}
            }
        }
        Ok(WalkControl::Completed)
    }

    /// An upper directory meets a file or whiteout in the lower layer.
    ///
    /// Returns `Some(Restart)` when the directory could simply be promoted,
    /// `None` when it was opened in place and the walk should continue into
    /// its children.
    fn merge_over_cover(
        &self,
        upath: &Path,
        lpath: &Path,
        rel: &Path,
        lindex: usize,
    ) -> SteinResult<Option<WalkControl>> {
        let (next_cover, has_dir) = self.next_cover_below(rel, lindex)?;
        if !has_dir {
            // The cover hides no directory content further down; replacing
            // it with the upper directory exposes nothing.
            fs::remove_file(lpath).map_err(|e| merge_error(lpath, e))?;
            fs::rename(upath, lpath).map_err(|e| merge_error(upath, e))?;
            return Ok(Some(WalkControl::Restart));
        }

        // "Open" the directory in the lower layer and re-cover every name
        // that the old cover was hiding in the layers between the lower
        // layer and the next cover down.
        fs::remove_file(lpath).map_err(|e| merge_error(lpath, e))?;
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o000);
        builder.create(lpath).map_err(|e| merge_error(lpath, e))?;
        copy_attributes(upath, lpath).map_err(|e| merge_error(lpath, e))?;

        for name in self.visible_between(rel, lindex + 1, next_cover - 1)? {
            let wh = lpath.join(&name);
            create_whiteout(&wh).map_err(|e| merge_error(&wh, e))?;
        }
        Ok(None)
    }

    /// Scan the layers strictly below `lindex` for the next cover (file or
    /// whiteout) at `rel`. Returns its index (`layers.len()` when none) and
    /// whether any directory was seen above it.
    fn next_cover_below(&self, rel: &Path, lindex: usize) -> SteinResult<(usize, bool)> {
        let mut has_dir = false;
        if lindex != self.layers.len() - 1 {
            for i in (lindex + 1)..self.layers.len() {
                let ipath = self.base.join(&self.layers[i]).join(rel);
                match classify(&ipath).map_err(|e| merge_error(&ipath, e))? {
                    OverlayEntry::File | OverlayEntry::Whiteout => return Ok((i, has_dir)),
                    OverlayEntry::Directory => has_dir = true,
                    OverlayEntry::Air => {}
                }
            }
        }
        Ok((self.layers.len(), has_dir))
    }

    /// Basenames visible at `rel` across the layer range `[lbound, ubound]`,
    /// scanned bottom-up so that a whiteout in a higher layer cancels the
    /// name accumulated from a lower one.
    fn visible_between(
        &self,
        rel: &Path,
        lbound: usize,
        ubound: usize,
    ) -> SteinResult<BTreeSet<OsString>> {
        let mut names = BTreeSet::new();
        if ubound < lbound {
            return Ok(names);
        }
        for i in (lbound..=ubound).rev() {
            let ipath = self.base.join(&self.layers[i]).join(rel);
            let Ok(dir) = fs::read_dir(&ipath) else {
                // Nothing (or a non-directory) at this level.
                continue;
            };
            for dirent in dir.flatten() {
                let Ok(meta) = dirent.metadata() else {
                    continue;
                };
                match OverlayEntry::from_metadata(&meta) {
                    OverlayEntry::Whiteout => {
                        names.remove(&dirent.file_name());
                    }
                    _ => {
                        names.insert(dirent.file_name());
                    }
                }
            }
        }
        Ok(names)
    }
}

/// Remove whatever sits at `path`, recursively for directories. Missing
/// paths are fine.
fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn merge_error(path: &Path, source: io::Error) -> SteinError {
    SteinError::Merge {
        path: path.to_path_buf(),
        source,
    }
}

fn walk_error(path: &Path, source: walkdir::Error) -> SteinError {
    merge_error(path, source.into())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::filesystem::{Filesystem, LayerStack};

    fn two_layer_fs(base: &std::path::Path) -> Filesystem {
        for dir in ["99-top", "00-base"] {
            std::fs::create_dir_all(base.join(dir)).unwrap();
        }
        let layers =
            LayerStack::new(vec!["99-top".to_string(), "00-base".to_string()]).unwrap();
        Filesystem::new(base, layers)
    }

    #[test]
    fn sibling_directory_promotions_restart_the_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = two_layer_fs(tmp.path());
        let top = tmp.path().join("99-top");

        for dir in ["alpha", "beta"] {
            std::fs::create_dir(top.join(dir)).unwrap();
            std::fs::write(top.join(dir).join("f"), b"x").unwrap();
        }

        let restarts = overlay
            .merge_counted(&PathBuf::from(""), "top", "base", true)
            .unwrap();
        assert_eq!(restarts, 2);

        let base = tmp.path().join("00-base");
        assert!(base.join("alpha/f").is_file());
        assert!(base.join("beta/f").is_file());
        assert_eq!(std::fs::read_dir(&top).unwrap().count(), 0);
    }

    #[test]
    fn merging_a_missing_subtree_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = two_layer_fs(tmp.path());
        assert_eq!(
            overlay.merge_counted(&PathBuf::from("not/there"), "top", "base", false)
                .unwrap(),
            0
        );
    }

    #[test]
    fn merge_refuses_a_mounted_overlay() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = two_layer_fs(tmp.path());
        overlay.pretend_mounted(tmp.path());
        assert!(matches!(
            overlay.merge("", "top", "base", true),
            Err(stein_common::SteinError::AlreadyMounted)
        ));
        overlay.pretend_unmounted();
        assert!(overlay.merge("", "top", "base", true).is_ok());
    }

    #[test]
    fn leading_slash_in_path_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = two_layer_fs(tmp.path());
        std::fs::write(tmp.path().join("99-top/f"), b"x").unwrap();

        overlay.merge("/f", "top", "base", false).unwrap();
        assert!(tmp.path().join("00-base/f").is_file());
    }
}
