//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The command is also marked `kill_on_drop` so a dropped handle never leaves
/// an orphaned encoder running.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(feature = "tokio")]
mod scoped {
    use std::process::ExitStatus;
    use std::time::Duration;

    use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
    use tracing::{debug, warn};

    /// How long [`ScopedChild::terminate`] waits after asking the process to
    /// exit, and again after killing it.
    pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

    /// Owns a child process for the lifetime of a scope.
    ///
    /// The process is terminated on [`ScopedChild::terminate`] or, failing that,
    /// when the guard is dropped. Both paths are safe to hit after the process
    /// already exited on its own.
    #[derive(Debug)]
    pub struct ScopedChild {
        label: String,
        child: Option<Child>,
    }

    impl ScopedChild {
        pub fn new(label: impl Into<String>, child: Child) -> Self {
            Self {
                label: label.into(),
                child: Some(child),
            }
        }

        pub fn take_stdout(&mut self) -> Option<ChildStdout> {
            self.child.as_mut().and_then(|c| c.stdout.take())
        }

        pub fn take_stdin(&mut self) -> Option<ChildStdin> {
            self.child.as_mut().and_then(|c| c.stdin.take())
        }

        pub fn take_stderr(&mut self) -> Option<ChildStderr> {
            self.child.as_mut().and_then(|c| c.stderr.take())
        }

        /// Close stdin and send SIGTERM, wait up to [`TERMINATE_GRACE`], then
        /// kill. On Windows the process is killed straight away.
        ///
        /// Returns `None` when the process was already released or never
        /// reported an exit status.
        pub async fn terminate(&mut self) -> Option<ExitStatus> {
            let mut child = self.child.take()?;

            if let Ok(Some(status)) = child.try_wait() {
                debug!(process = %self.label, %status, "Process already exited");
                return Some(status);
            }

            drop(child.stdin.take());
            if request_exit(&child, &self.label) {
                match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(process = %self.label, %status, "Process exited");
                        return Some(status);
                    }
                    Ok(Err(e)) => {
                        warn!(process = %self.label, error = %e, "Error waiting for process");
                        return None;
                    }
                    Err(_) => warn!(process = %self.label, "Process did not exit in time, killing it"),
                }
            }

            if let Err(e) = child.start_kill() {
                warn!(process = %self.label, error = %e, "Failed to kill process");
            }
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(process = %self.label, %status, "Process killed");
                    Some(status)
                }
                Ok(Err(e)) => {
                    warn!(process = %self.label, error = %e, "Error waiting for killed process");
                    None
                }
                Err(_) => {
                    warn!(process = %self.label, "Killed process did not exit in time");
                    None
                }
            }
        }
    }

    /// Ask the process to exit. Returns whether a request was delivered.
    #[cfg(unix)]
    fn request_exit(child: &Child, label: &str) -> bool {
        let Some(pid) = child.id().and_then(|id| libc::pid_t::try_from(id).ok()) else {
            return false;
        };
        // SAFETY: `pid` is a child owned by this guard that has not been reaped.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            debug!(process = %label, pid, "Sent SIGTERM");
            true
        } else {
            warn!(process = %label, error = %std::io::Error::last_os_error(), "Failed to send SIGTERM");
            false
        }
    }

    #[cfg(not(unix))]
    fn request_exit(_child: &Child, _label: &str) -> bool {
        false
    }

    impl Drop for ScopedChild {
        fn drop(&mut self) {
            if let Some(child) = self.child.as_mut()
                && let Ok(None) = child.try_wait()
            {
                debug!(process = %self.label, "Killing process on drop");
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(feature = "tokio")]
pub use scoped::{ScopedChild, TERMINATE_GRACE};

/// Relay a child's stderr into the log, one event per line.
///
/// Lines mentioning an error are logged at `warn`, everything else at `debug`.
/// The task ends when the stream closes.
#[cfg(feature = "tokio")]
pub fn forward_stderr<R>(label: impl Into<String>, stderr: R) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::{AsyncBufReadExt, BufReader};

    let label = label.into();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line.to_ascii_lowercase().contains("error") {
                        tracing::warn!(process = %label, "{line}");
                    } else {
                        tracing::debug!(process = %label, "{line}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(process = %label, error = %e, "stderr closed");
                    break;
                }
            }
        }
    })
}
