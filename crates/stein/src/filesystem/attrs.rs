//! Metadata copying between layer entries.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use rustix::fs::{AtFlags, CWD, Timestamps, XattrFlags, lgetxattr, llistxattr, lsetxattr, utimensat};
use rustix::io::Errno;
use rustix::time::Timespec;

/// Copy mode, ownership, timestamps and extended attributes from `src` to
/// `dst`.
///
/// File contents are left alone and directories are not entered. Symlink
/// sources keep their own (meaningless) mode. `dst` must already exist.
pub fn copy_attributes(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = src.symlink_metadata()?;

    if !meta.file_type().is_symlink() {
        std::fs::set_permissions(dst, meta.permissions())?;
    }

    lchown(dst, meta.uid(), meta.gid())?;

    let times = Timestamps {
        last_access: Timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        last_modification: Timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    };
    utimensat(CWD, dst, &times, AtFlags::SYMLINK_NOFOLLOW).map_err(io::Error::from)?;

    copy_xattrs(src, dst)
}

fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::lchown(c_path.as_ptr(), uid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn copy_xattrs(src: &Path, dst: &Path) -> io::Result<()> {
    let names = match xattr_names(src) {
        Ok(names) => names,
        // No xattr support on this filesystem: nothing to carry over.
        Err(Errno::NOTSUP) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for name in names {
        let value = match xattr_value(src, &name) {
            Ok(value) => value,
            // Raced with a concurrent removal.
            Err(Errno::NODATA) => continue,
            Err(e) => return Err(e.into()),
        };
        lsetxattr(dst, name.as_c_str(), &value, XattrFlags::empty())
            .map_err(io::Error::from)?;
    }
    Ok(())
}

fn xattr_names(path: &Path) -> Result<Vec<CString>, Errno> {
    let size = llistxattr(path, &mut [])?;
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; size];
    let n = llistxattr(path, &mut buf)?;
    buf.truncate(n);
    Ok(buf
        .split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .filter_map(|name| CString::new(name.to_vec()).ok())
        .collect())
}

fn xattr_value(path: &Path, name: &CStr) -> Result<Vec<u8>, Errno> {
    let size = lgetxattr(path, name, &mut [])?;
    let mut buf = vec![0u8; size];
    let n = lgetxattr(path, name, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn copies_mode_and_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&src).unwrap();
        std::fs::create_dir(&dst).unwrap();

        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o750)).unwrap();
        copy_attributes(&src, &dst).unwrap();

        let src_meta = src.symlink_metadata().unwrap();
        let dst_meta = dst.symlink_metadata().unwrap();
        assert_eq!(dst_meta.mode() & 0o7777, 0o750);
        assert_eq!(
            (dst_meta.mtime(), dst_meta.mtime_nsec()),
            (src_meta.mtime(), src_meta.mtime_nsec())
        );
        assert_eq!(dst_meta.uid(), src_meta.uid());
        assert_eq!(dst_meta.gid(), src_meta.gid());
    }

    #[test]
    fn does_not_copy_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::write(&src, b"payload").unwrap();
        std::fs::write(&dst, b"").unwrap();

        copy_attributes(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"");
    }
}
