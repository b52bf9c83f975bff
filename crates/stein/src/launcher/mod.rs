//! Host service-manager integration.
//!
//! The container core needs a handful of operations from the host: boot a
//! tree, run a process in a chroot or in a booted machine, probe the init,
//! and shut things down. [`Launcher`] is that seam; [`SystemdLauncher`] is
//! the production implementation on top of the systemd machine tools.

mod systemd;

pub use systemd::SystemdLauncher;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stein_common::SteinResult;

/// Stdio wiring for a process launched inside a container.
#[derive(Debug)]
pub struct ProcessIo {
    /// Standard input of the launched process.
    pub stdin: Stdio,
    /// Standard output of the launched process.
    pub stdout: Stdio,
    /// Standard error of the launched process.
    pub stderr: Stdio,
}

impl ProcessIo {
    /// Inherit all three streams from the calling process.
    #[must_use]
    pub fn inherit() -> Self {
        Self {
            stdin: Stdio::inherit(),
            stdout: Stdio::inherit(),
            stderr: Stdio::inherit(),
        }
    }

    /// Connect all three streams to `/dev/null`.
    #[must_use]
    pub fn null() -> Self {
        Self {
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

impl Default for ProcessIo {
    fn default() -> Self {
        Self::inherit()
    }
}

/// State of the init inside a container, as reported by the service
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// The system is fully operational.
    Running,
    /// Still initializing, starting, or not yet past early boot.
    Starting,
    /// Operational, but some units have failed.
    Degraded,
    /// Emergency shell, or a state the manager could not name.
    Maintenance,
    /// The system is shutting down.
    Stopping,
    /// The init could not be reached at all.
    Unreachable,
}

impl SystemState {
    /// Map `systemctl is-system-running` output onto a state.
    #[must_use]
    pub fn classify(output: &str) -> Self {
        match output {
            "running" => SystemState::Running,
            "initializing" | "starting" | "offline" => SystemState::Starting,
            "degraded" => SystemState::Degraded,
            "stopping" => SystemState::Stopping,
            // No output at all means the bus inside the container was not
            // reachable.
            "" => SystemState::Unreachable,
            // "maintenance", "unknown", and anything unparseable.
            _ => SystemState::Maintenance,
        }
    }
}

/// Handle to a booting init process. Resolves when the process exits, with
/// whatever status it exited with.
pub struct BootHandle {
    exit: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl BootHandle {
    /// Wrap a future that resolves when the boot process has exited.
    pub fn new(exit: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            exit: Box::pin(exit),
        }
    }

    /// Wait for the boot process to exit.
    pub async fn wait(self) {
        self.exit.await;
    }
}

/// The operations the container core requires from the host service
/// manager.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the long-running process that boots the container at `root`.
    ///
    /// Returns as soon as the process is spawned; the handle resolves when
    /// it exits. `properties` are opaque resource-control strings forwarded
    /// to the service manager unmodified.
    async fn boot(
        &self,
        name: &str,
        root: &Path,
        properties: &[String],
    ) -> SteinResult<BootHandle>;

    /// Run one process in an ephemeral chroot of `root` and return its exit
    /// code. Cancellation kills the process group.
    async fn run_chroot(
        &self,
        name: &str,
        root: &Path,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32>;

    /// Run a process inside the already-booted container `name` and return
    /// its exit code. Cancellation kills the process group.
    async fn run_booted(
        &self,
        name: &str,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32>;

    /// Probe the init of the booted container.
    async fn system_state(&self, name: &str) -> SteinResult<SystemState>;

    /// Whether the container is still registered with the host.
    async fn is_registered(&self, name: &str) -> SteinResult<bool>;

    /// Ask a booted container to shut down gracefully.
    async fn poweroff(&self, name: &str) -> SteinResult<()>;

    /// Hard-kill a chroot-mode container.
    async fn terminate(&self, name: &str) -> SteinResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_system_running_output() {
        assert_eq!(SystemState::classify("running"), SystemState::Running);
        assert_eq!(SystemState::classify("initializing"), SystemState::Starting);
        assert_eq!(SystemState::classify("starting"), SystemState::Starting);
        assert_eq!(SystemState::classify("offline"), SystemState::Starting);
        assert_eq!(SystemState::classify("degraded"), SystemState::Degraded);
        assert_eq!(SystemState::classify("maintenance"), SystemState::Maintenance);
        assert_eq!(SystemState::classify("unknown"), SystemState::Maintenance);
        assert_eq!(SystemState::classify("stopping"), SystemState::Stopping);
        assert_eq!(SystemState::classify(""), SystemState::Unreachable);
        assert_eq!(SystemState::classify("garbled"), SystemState::Maintenance);
    }
}
