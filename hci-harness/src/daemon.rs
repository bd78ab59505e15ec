//! Supervision of the CI daemon under test.

use crate::error::{HarnessError, HarnessResult};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub struct DaemonProcess {
    program: PathBuf,
    pid: Option<u32>,
    child: Child,
    exit: Option<ExitStatus>,
}

impl DaemonProcess {
    /// Start `bin --config <config_path>` with stdout and stderr appended to
    /// `log_path`.
    pub fn spawn(
        bin: &Path,
        config_path: &Path,
        log_path: &Path,
        env: &BTreeMap<String, String>,
    ) -> HarnessResult<Self> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(bin);
        cmd.arg("--config")
            .arg(config_path)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(dir) = config_path.parent() {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| HarnessError::SpawnFailed {
            program: bin.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        info!(
            "Daemon {} started (pid={:?}, log: {})",
            bin.display(),
            pid,
            log_path.display()
        );

        Ok(Self {
            program: bin.to_path_buf(),
            pid,
            child,
            exit: None,
        })
    }

    /// Wait for the daemon to exit on its own.
    pub async fn wait(&mut self) -> HarnessResult<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        if status.success() {
            info!("Daemon exited: {}", status);
        } else {
            warn!("Daemon {} exited early: {}", self.program.display(), status);
        }
        Ok(status)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn shutdown(&mut self, grace: Duration) -> HarnessResult<ExitStatus> {
        if let Some(status) = self.exit {
            debug!("Daemon already exited ({}); nothing to stop", status);
            return Ok(status);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit = Some(status);
            return Ok(status);
        }

        match self.pid {
            Some(pid) if send_terminate(pid) => {
                info!("Sent SIGTERM to daemon (pid={}), grace {:?}", pid, grace);
                if let Ok(waited) = tokio::time::timeout(grace, self.child.wait()).await {
                    let status = waited?;
                    self.exit = Some(status);
                    info!("Daemon stopped: {}", status);
                    return Ok(status);
                }
                warn!("Daemon ignored SIGTERM for {:?}; killing", grace);
            }
            _ => warn!("Could not signal daemon; killing"),
        }

        self.child.kill().await?;
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }
}

fn send_terminate(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to send TERM to process {}: {}", pid, e);
            false
        }
    }
}
