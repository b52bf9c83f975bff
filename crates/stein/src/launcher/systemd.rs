//! Launcher backed by the systemd machine tools.
//!
//! Boot and chroot runs go through `systemd-nspawn`; processes inside a
//! booted machine go through `systemd-run`; probing and shutdown use
//! `systemctl` and `machinectl`. The binaries are resolved from `PATH`.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use stein_common::{SteinError, SteinResult};

use super::{BootHandle, Launcher, ProcessIo, SystemState};

const NSPAWN: &str = "systemd-nspawn";
const SYSTEMD_RUN: &str = "systemd-run";
const SYSTEMCTL: &str = "systemctl";
const MACHINECTL: &str = "machinectl";

/// [`Launcher`] implementation shelling out to the host systemd tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemdLauncher;

#[async_trait]
impl Launcher for SystemdLauncher {
    async fn boot(
        &self,
        name: &str,
        root: &Path,
        properties: &[String],
    ) -> SteinResult<BootHandle> {
        let mut cmd = Command::new(NSPAWN);
        cmd.arg("--quiet")
            .arg("--boot")
            .arg("-M")
            .arg(name)
            .arg("-D")
            .arg(root);
        for property in properties {
            cmd.arg(format!("--property={property}"));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| spawn_error(NSPAWN, e))?;
        tracing::debug!(name, root = %root.display(), "spawned boot process");
        Ok(BootHandle::new(async move {
            let _ = child.wait().await;
        }))
    }

    async fn run_chroot(
        &self,
        name: &str,
        root: &Path,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32> {
        let mut cmd = std::process::Command::new(NSPAWN);
        cmd.arg("--quiet").arg("-M").arg(name).arg("-D").arg(root);
        cmd.args(argv);
        run_to_completion(NSPAWN, cmd, io, cancel).await
    }

    async fn run_booted(
        &self,
        name: &str,
        argv: &[String],
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> SteinResult<i32> {
        let mut cmd = std::process::Command::new(SYSTEMD_RUN);
        cmd.arg("--quiet")
            .arg("--wait")
            .arg("--pty")
            .arg("-M")
            .arg(name);
        cmd.args(argv);
        run_to_completion(SYSTEMD_RUN, cmd, io, cancel).await
    }

    async fn system_state(&self, name: &str) -> SteinResult<SystemState> {
        let output = Command::new(SYSTEMCTL)
            .arg("is-system-running")
            .arg("-M")
            .arg(name)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(SYSTEMCTL, e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(SystemState::classify(stdout.trim()))
    }

    async fn is_registered(&self, name: &str) -> SteinResult<bool> {
        let status = Command::new(MACHINECTL)
            .arg("status")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| spawn_error(MACHINECTL, e))?;
        Ok(status.success())
    }

    async fn poweroff(&self, name: &str) -> SteinResult<()> {
        machinectl("poweroff", name).await
    }

    async fn terminate(&self, name: &str) -> SteinResult<()> {
        machinectl("terminate", name).await
    }
}

async fn machinectl(verb: &str, name: &str) -> SteinResult<()> {
    let output = Command::new(MACHINECTL)
        .arg(verb)
        .arg(name)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(MACHINECTL, e))?;
    if output.status.success() {
        return Ok(());
    }
    let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if message.is_empty() {
        message = String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
    Err(SteinError::LauncherFailure { message })
}

/// Spawn the prepared command in its own process group, wire up stdio, and
/// wait for it, honoring cancellation.
async fn run_to_completion(
    binary: &str,
    mut cmd: std::process::Command,
    io: ProcessIo,
    cancel: &CancellationToken,
) -> SteinResult<i32> {
    cmd.stdin(io.stdin).stdout(io.stdout).stderr(io.stderr);
    // Children get their own process group so cancellation can take the
    // whole tree down with one signal.
    cmd.process_group(0);

    let mut cmd = Command::from(cmd);
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| spawn_error(binary, e))?;

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let Some(status) = waited else {
        kill_process_group(&child);
        let _ = child.wait().await;
        return Err(SteinError::LauncherFailure {
            message: format!("{binary} cancelled"),
        });
    };
    let status = status.map_err(|e| SteinError::LauncherFailure {
        message: format!("{binary}: {e}"),
    })?;
    match status.code() {
        Some(code) => Ok(code),
        None => Err(SteinError::LauncherFailure {
            message: format!("{binary} was killed by a signal"),
        }),
    }
}

fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

fn spawn_error(binary: &str, err: io::Error) -> SteinError {
    if err.kind() == io::ErrorKind::NotFound {
        SteinError::LauncherUnavailable {
            binary: binary.to_string(),
        }
    } else {
        SteinError::LauncherFailure {
            message: format!("failed to spawn {binary}: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_maps_to_launcher_unavailable() {
        let err = run_to_completion(
            "stein-test-no-such-binary",
            std::process::Command::new("stein-test-no-such-binary"),
            ProcessIo::null(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SteinError::LauncherUnavailable { .. }));
    }

    #[tokio::test]
    async fn exit_codes_are_propagated() {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 42");
        let code = run_to_completion("/bin/sh", cmd, ProcessIo::null(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 42);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 30");

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = run_to_completion("/bin/sh", cmd, ProcessIo::null(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SteinError::LauncherFailure { .. }));
    }
}
