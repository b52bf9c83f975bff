//! Overlay entry classification.
//!
//! Every path inside a single layer is one of four things to the overlay:
//! absent, a whiteout (the kernel's deletion sentinel), a directory, or
//! "some file" (regular file, symlink, socket, fifo, real device).

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use rustix::fs::{CWD, FileType, Mode, mknodat};

/// What a path holds inside one overlay layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEntry {
    /// The path does not exist in this layer.
    Air,
    /// A whiteout: the name is deleted in this and higher layers.
    Whiteout,
    /// Anything that is neither a directory nor a whiteout.
    File,
    /// A directory.
    Directory,
}

impl OverlayEntry {
    /// Classify from `lstat` metadata.
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        if meta.is_dir() {
            OverlayEntry::Directory
        } else if is_whiteout(meta) {
            OverlayEntry::Whiteout
        } else {
            OverlayEntry::File
        }
    }
}

/// Classify the entry at `path` without following symlinks.
pub fn classify(path: &Path) -> io::Result<OverlayEntry> {
    match path.symlink_metadata() {
        Ok(meta) => Ok(OverlayEntry::from_metadata(&meta)),
        Err(e)
            if e.kind() == io::ErrorKind::NotFound
                || e.kind() == io::ErrorKind::NotADirectory =>
        {
            Ok(OverlayEntry::Air)
        }
        Err(e) => Err(e),
    }
}

/// Whether the metadata describes a whiteout: a character device with
/// `rdev == 0`.
#[must_use]
pub fn is_whiteout(meta: &Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Create a whiteout device at `path`: a `0:0` character special node with
/// mode `0000`.
pub fn create_whiteout(path: &Path) -> io::Result<()> {
    mknodat(CWD, path, FileType::CharacterDevice, Mode::empty(), 0).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_air_file_and_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            classify(&tmp.path().join("missing")).unwrap(),
            OverlayEntry::Air
        );

        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(classify(&file).unwrap(), OverlayEntry::File);

        let dir = tmp.path().join("d");
        std::fs::create_dir(&dir).unwrap();
        assert_eq!(classify(&dir).unwrap(), OverlayEntry::Directory);

        // A path whose parent is a regular file is as absent as it gets.
        assert_eq!(
            classify(&file.join("below")).unwrap(),
            OverlayEntry::Air
        );
    }

    #[test]
    fn symlinks_classify_as_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("d");
        std::fs::create_dir(&dir).unwrap();
        let link = tmp.path().join("l");
        std::os::unix::fs::symlink(&dir, &link).unwrap();
        assert_eq!(classify(&link).unwrap(), OverlayEntry::File);
    }

    #[test]
    fn whiteout_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let wh = tmp.path().join("gone");
        create_whiteout(&wh).unwrap();

        let meta = wh.symlink_metadata().unwrap();
        assert!(is_whiteout(&meta));
        assert_eq!(classify(&wh).unwrap(), OverlayEntry::Whiteout);
        assert_eq!(meta.mode() & 0o7777, 0);
    }
}
