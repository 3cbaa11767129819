//! Shell runner for delegated `run` actions.
//!
//! Each command gets its own `sh -c` process in the executor's working
//! directory, leading a fresh process group. If the command outlives the
//! timeout, or the caller stops waiting, the whole group is killed so
//! background jobs and pipelines do not outlive it.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

/// Exit code reported when the process was killed by a signal.
pub const EXIT_CODE_SIGNALED: i32 = -1;

/// Exit code reported when the command hit the timeout.
pub const EXIT_CODE_TIMEOUT: i32 = -2;

/// Result of a shell command execution
#[derive(Debug)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ShellResult {
    /// stdout followed by stderr
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }
}

/// Execute a shell command with timeout.
///
/// Returns `Err` only when the process could not be spawned at all; a
/// timeout is reported through [`ShellResult::timed_out`].
pub async fn execute(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<ShellResult, std::io::Error> {
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    let mut group = GroupKill { pgid: child.id() };

    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    if result.is_ok() {
        group.disarm();
    }

    match result {
        Ok(output) => {
            let output = output?;
            Ok(ShellResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(EXIT_CODE_SIGNALED),
                timed_out: false,
                duration_ms,
            })
        }
        Err(_) => Ok(ShellResult {
            stdout: String::new(),
            stderr: format!("Command timed out after {timeout:?}"),
            exit_code: EXIT_CODE_TIMEOUT,
            timed_out: true,
            duration_ms,
        }),
    }
}

/// Kills the command's process group on drop unless disarmed.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take().and_then(|p| i32::try_from(p).ok()) {
            // SAFETY: signalling a process group we created; no memory is touched.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute("echo hi", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hi");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn combines_stderr_after_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute("echo out; echo err >&2; exit 3", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.combined_output(), "out\nerr\n");
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let result = execute("ls", dir.path(), Duration::from_secs(5)).await.unwrap();
        assert!(result.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn timeout_reports_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute("sleep 5", dir.path(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT);
        assert!(result.duration_ms < 5000);
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_background_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(
            "sleep 30 & echo $! > bg.pid; wait",
            dir.path(),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert!(result.timed_out);

        let pid = std::fs::read_to_string(dir.path().join("bg.pid")).unwrap();
        let pid = pid.trim();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(is_gone(pid), "background job {pid} survived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let run = execute(
            "sleep 30 & echo $! > bg.pid; wait",
            dir.path(),
            Duration::from_secs(30),
        );
        let _ = tokio::time::timeout(Duration::from_millis(300), run).await;

        let pid = std::fs::read_to_string(dir.path().join("bg.pid")).unwrap();
        let pid = pid.trim();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(is_gone(pid), "background job {pid} survived the caller");
    }
}
