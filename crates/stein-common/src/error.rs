//! Common error types for the stein crates.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SteinError`].
pub type SteinResult<T> = Result<T, SteinError>;

/// Common errors across the stein crates.
#[derive(Error, Diagnostic, Debug)]
pub enum SteinError {
    /// No layer in the stack carries the given short name.
    #[error("no such layer: {name}")]
    #[diagnostic(code(stein::layer::unknown))]
    UnknownLayer {
        /// The short name that was looked up.
        name: String,
    },

    /// A layer directory name does not follow the `<priority>-<shortname>` form.
    #[error("invalid layer directory name: {name}")]
    #[diagnostic(
        code(stein::layer::invalid_name),
        help("layer directories are named like \"10-base\": a digit prefix, a dash, a unique short name")
    )]
    InvalidLayerName {
        /// The offending directory name.
        name: String,
    },

    /// A layer stack must contain at least one layer.
    #[error("layer stack is empty")]
    #[diagnostic(code(stein::layer::empty_stack))]
    EmptyLayerStack,

    /// The kernel overlay mount failed.
    #[error("overlay mount failed: {source}")]
    #[diagnostic(code(stein::fs::mount))]
    Mount {
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// The kernel unmount or the mountpoint cleanup failed.
    #[error("overlay unmount failed: {source}")]
    #[diagnostic(code(stein::fs::unmount))]
    Unmount {
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// A filesystem operation during a layer merge failed.
    #[error("merge failed at {}: {}", path.display(), source)]
    #[diagnostic(
        code(stein::fs::merge),
        help("the layers are left partially merged; re-running the merge will pick up where it stopped")
    )]
    Merge {
        /// The path the merge was working on.
        path: PathBuf,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// The operation requires a mounted overlay.
    #[error("overlay is not mounted")]
    #[diagnostic(code(stein::fs::not_mounted))]
    NotMounted,

    /// The operation requires the overlay to be unmounted.
    #[error("overlay is currently mounted")]
    #[diagnostic(code(stein::fs::already_mounted))]
    AlreadyMounted,

    /// The in-container init never reached a running state, or died while it
    /// was being watched.
    #[error("container died")]
    #[diagnostic(code(stein::container::died))]
    ContainerDied,

    /// A chroot-mode process is already running in this container.
    #[error("container is busy running a chroot-mode process")]
    #[diagnostic(code(stein::container::busy))]
    Busy,

    /// The container is not booted.
    #[error("container is not booted")]
    #[diagnostic(code(stein::container::not_booted))]
    NotBooted,

    /// A required host binary could not be resolved.
    #[error("launcher binary not found: {binary}")]
    #[diagnostic(
        code(stein::launcher::unavailable),
        help("systemd-nspawn, systemd-run, systemctl and machinectl must be installed on the host")
    )]
    LauncherUnavailable {
        /// The binary that was not found.
        binary: String,
    },

    /// The host service manager reported a failure.
    #[error("launcher failed: {message}")]
    #[diagnostic(code(stein::launcher::failure))]
    LauncherFailure {
        /// Output captured from the failing tool.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SteinError::UnknownLayer {
            name: "custom".to_string(),
        };
        assert_eq!(err.to_string(), "no such layer: custom");
    }

    #[test]
    fn merge_error_carries_path() {
        let err = SteinError::Merge {
            path: PathBuf::from("/var/lib/stein/50-custom/etc"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/var/lib/stein/50-custom/etc"));
    }
}
