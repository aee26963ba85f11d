use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::types::{LeanGymError, LeanGymConfig};

/// The lean-gym child process.
pub struct GymProcess {
    child: Child,
}

impl GymProcess {
    /// Launch lean-gym from its checkout directory with piped stdin/stdout.
    ///
    /// stderr is discarded: lean-gym reports everything, warnings included,
    /// on stdout.
    pub fn spawn(config: &LeanGymConfig) -> Result<(Self, ChildStdin, ChildStdout), LeanGymError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .current_dir(&config.lean_gym_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LeanGymError::Transport("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LeanGymError::Transport("Failed to capture stdout".into()))?;

        tracing::debug!(
            command = %config.command.display(),
            lean_gym_path = %config.lean_gym_path.display(),
            pid = child.id(),
            "Spawned lean-gym"
        );

        Ok((Self { child }, stdin, stdout))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Ask the process to exit, then kill it if it is still alive after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        self.request_exit();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "lean-gym exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Waiting for lean-gym failed"),
            Err(_) => {
                tracing::debug!(grace_ms = grace.as_millis() as u64, "lean-gym still running, killing");
                // Ignore errors: it may have exited in the meantime.
                let _ = self.child.kill().await;
            }
        }
    }

    #[cfg(unix)]
    fn request_exit(&self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain syscall on a pid we own and have not reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&self) {}
}
