//! The container state machine.
//!
//! A [`Container`] ties a [`Filesystem`] to a name known to the host
//! service manager. Commands are run through [`Container::run`], which
//! mounts the overlay on demand and picks between three execution paths:
//! a process inside an already-booted machine, booting first and then
//! running, or an ephemeral chroot.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use stein_common::{SteinError, SteinResult};

use crate::filesystem::{Filesystem, LayerStack};
use crate::launcher::{Launcher, ProcessIo, SystemState, SystemdLauncher};

/// Path of the login shell used by [`Container::command`] and
/// [`Container::shell`].
pub const SHELL_PATH: &str = "/bin/bash";

/// Cadence of the boot and shutdown status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mutable run state shared with the boot watcher.
struct RunState {
    prefer_boot: bool,
    /// A boot is in flight. Claimed by exactly one `run` at a time;
    /// concurrent runs wait for the outcome instead of spawning a second
    /// init for the same machine name.
    booting: bool,
    booted: bool,
    chrooted: bool,
    properties: Vec<String>,
    /// Cancelled exactly when a booted init has died. Replaced with a fresh
    /// token whenever the death has been observed.
    cancel_boot: CancellationToken,
}

/// An instance of a container bound to a layer stack.
///
/// `name` identifies the machine to the host service manager and must be
/// unique process-wide. The container exclusively owns its filesystem
/// handle.
pub struct Container {
    name: String,
    fs: Arc<Filesystem>,
    launcher: Arc<dyn Launcher>,
    state: Arc<RwLock<RunState>>,
}

impl Container {
    /// Create a container descriptor over `base` and `layers`, driven by
    /// the host systemd tools. Nothing is mounted or started yet.
    pub fn new(name: impl Into<String>, base: impl Into<PathBuf>, layers: LayerStack) -> Self {
        Self::with_launcher(name, base, layers, Arc::new(SystemdLauncher))
    }

    /// Same as [`new`](Self::new) with a caller-provided launcher.
    pub fn with_launcher(
        name: impl Into<String>,
        base: impl Into<PathBuf>,
        layers: LayerStack,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            name: name.into(),
            fs: Arc::new(Filesystem::new(base, layers)),
            launcher,
            state: Arc::new(RwLock::new(RunState {
                prefer_boot: true,
                booting: false,
                booted: false,
                chrooted: false,
                properties: Vec::new(),
                cancel_boot: CancellationToken::new(),
            })),
        }
    }

    /// The machine name registered with the host service manager.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filesystem handle backing this container.
    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    /// Whether a booted system or a chroot-mode process is active.
    pub fn is_active(&self) -> bool {
        let st = self.state.read();
        st.booted || st.chrooted
    }

    /// Choose whether [`run`](Self::run) boots the tree when it can
    /// (default) or always uses chroot mode.
    pub fn set_prefer_boot(&self, prefer_boot: bool) {
        self.state.write().prefer_boot = prefer_boot;
    }

    /// Replace the resource-control properties forwarded on the next boot.
    /// An empty vector clears them.
    pub fn set_properties(&self, properties: Vec<String>) {
        self.state.write().properties = properties;
    }

    /// Append one resource-control property, e.g. `"CPUQuota=80%"`.
    pub fn append_property(&self, property: impl Into<String>) {
        self.state.write().properties.push(property.into());
    }

    /// Run `argv` inside the container and return its exit code.
    ///
    /// Mounts the overlay if needed. If the container is booted, the
    /// process runs inside the booted system; otherwise, if boot is
    /// preferred and the tree carries an init, the container is booted
    /// first; otherwise the process runs in an ephemeral chroot.
    ///
    /// Cancelling `cancel` kills the spawned process but leaves a booted
    /// container running.
    pub async fn run(
        &self,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32> {
        if !self.fs.is_mounted() {
            self.fs.mount()?;
        }

        let (booted, prefer_boot) = {
            let st = self.state.read();
            (st.booted, st.prefer_boot)
        };

        if booted {
            return self.run_in_booted(argv, io, cancel).await;
        }
        if prefer_boot && self.fs.is_bootable() {
            self.boot().await?;
            return self.run_in_booted(argv, io, cancel).await;
        }
        self.run_chroot(argv, io, cancel).await
    }

    /// Run a command line through the container's login shell
    /// (`/bin/bash -l -c <cmdline>`) with inherited stdio.
    pub async fn command(&self, cmdline: &str) -> SteinResult<i32> {
        let argv = vec![
            SHELL_PATH.to_string(),
            "-l".to_string(),
            "-c".to_string(),
            cmdline.to_string(),
        ];
        self.run(&argv, ProcessIo::inherit(), &CancellationToken::new())
            .await
    }

    /// Open an interactive login shell inside the container.
    pub async fn shell(&self) -> SteinResult<i32> {
        let argv = vec![SHELL_PATH.to_string(), "-l".to_string()];
        self.run(&argv, ProcessIo::inherit(), &CancellationToken::new())
            .await
    }

    /// Shut the container down and wait until the machine is gone.
    ///
    /// A booted system is asked to power off; a chroot-mode process is
    /// terminated; an idle container is left alone. The filesystem stays
    /// mounted.
    pub async fn shutdown(&self) -> SteinResult<()> {
        let (booted, chrooted) = {
            let st = self.state.write();
            (st.booted, st.chrooted)
        };

        if booted {
            self.launcher.poweroff(&self.name).await?;
        } else if chrooted {
            self.launcher.terminate(&self.name).await?;
        } else {
            return Ok(());
        }

        while self.launcher.is_registered(&self.name).await? {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut st = self.state.write();
        st.booted = false;
        let old = std::mem::replace(&mut st.cancel_boot, CancellationToken::new());
        old.cancel();
        tracing::info!(name = %self.name, "container shut down");
        Ok(())
    }

    async fn run_in_booted(
        &self,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32> {
        if !self.state.read().booted {
            return Err(SteinError::NotBooted);
        }
        self.launcher
            .run_booted(&self.name, argv, io, cancel)
            .await
    }

    async fn run_chroot(
        &self,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32> {
        let root = self.fs.target_dir()?;
        {
            let mut st = self.state.write();
            if st.booting || st.booted || st.chrooted {
                return Err(SteinError::Busy);
            }
            st.chrooted = true;
        }
        let _guard = ChrootGuard(Arc::clone(&self.state));

        self.launcher
            .run_chroot(&self.name, &root, argv, io, cancel)
            .await
    }

    /// Boot the mounted tree and wait until the init reports a usable
    /// state.
    ///
    /// Only one boot is in flight at a time; a `run` that loses the race
    /// waits for the winner's outcome and returns once the container is
    /// booted.
    async fn boot(&self) -> SteinResult<()> {
        let root = self.fs.target_dir()?;
        let (token, properties) = loop {
            {
                let mut st = self.state.write();
                if st.booted {
                    // Another run already brought the system up.
                    return Ok(());
                }
                if st.chrooted {
                    return Err(SteinError::Busy);
                }
                if !st.booting {
                    st.booting = true;
                    if st.cancel_boot.is_cancelled() {
                        st.cancel_boot = CancellationToken::new();
                    }
                    break (st.cancel_boot.clone(), st.properties.clone());
                }
            }
            // A boot is already in flight; wait for its verdict.
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        let _guard = BootGuard(Arc::clone(&self.state));

        tracing::info!(name = %self.name, root = %root.display(), "booting container");
        let handle = self.launcher.boot(&self.name, &root, &properties).await?;

        // The watcher owns the exit of the boot process. It signals the
        // death through the token it was handed, and holds only a weak
        // reference so a dropped Container is not kept alive by its init.
        let weak: Weak<RwLock<RunState>> = Arc::downgrade(&self.state);
        let death = token.clone();
        tokio::spawn(async move {
            handle.wait().await;
            death.cancel();
            if let Some(state) = weak.upgrade() {
                let mut st = state.write();
                if st.booted {
                    st.booted = false;
                    st.cancel_boot = CancellationToken::new();
                }
            }
        });

        loop {
            if token.is_cancelled() {
                return Err(SteinError::ContainerDied);
            }
            match self.launcher.system_state(&self.name).await? {
                SystemState::Running => break,
                SystemState::Degraded => {
                    tracing::warn!(name = %self.name, "init is running in degraded state");
                    break;
                }
                SystemState::Starting | SystemState::Unreachable => {}
                SystemState::Maintenance | SystemState::Stopping => {
                    tracing::warn!(name = %self.name, "init entered a terminal state during boot");
                    token.cancel();
                }
            }
            tokio::select! {
                _ = token.cancelled() => return Err(SteinError::ContainerDied),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        let mut st = self.state.write();
        if token.is_cancelled() {
            return Err(SteinError::ContainerDied);
        }
        st.booted = true;
        tracing::info!(name = %self.name, "container booted");
        Ok(())
    }
}

/// Clears the chroot flag when the run finishes, even if the run future is
/// dropped mid-flight.
struct ChrootGuard(Arc<RwLock<RunState>>);

impl Drop for ChrootGuard {
    fn drop(&mut self) {
        self.0.write().chrooted = false;
    }
}

/// Releases the boot claim on every exit from the boot procedure, success
/// and failure alike, so waiting runs get their verdict.
struct BootGuard(Arc<RwLock<RunState>>);

impl Drop for BootGuard {
    fn drop(&mut self) {
        self.0.write().booting = false;
    }
}
