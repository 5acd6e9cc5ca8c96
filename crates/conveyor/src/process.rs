//! Subprocess execution with bounded timeouts.
//!
//! Worktree operations shell out to the VCS binary; none of those calls
//! may hang a worker forever, so everything goes through
//! [`run_with_timeout`], which polls the child and kills it when the
//! deadline passes.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Captured result of a finished (or killed) command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed or had none.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Stdout and stderr combined, for error classification on tools that
    /// report through either stream.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Run `program` with `args` in `dir`, killing it after `timeout`.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    dir: &Path,
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {program} {args:?}"))?;

    // Drain the pipes on threads so a chatty child cannot deadlock against
    // a full pipe buffer while we wait on it.
    let mut stdout_pipe = child.stdout.take().context("child stdout missing")?;
    let mut stderr_pipe = child.stderr.take().context("child stderr missing")?;
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        buf
    });

    let mut timed_out = false;
    let status = loop {
        match child.try_wait().context("failed to wait on child")? {
            Some(status) => break Some(status),
            None if start.elapsed() >= timeout => {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    Ok(CommandOutput {
        exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        timed_out,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let td = tempdir().expect("tempdir");
        let out = run_with_timeout(
            "sh",
            &["-c", "echo hello; exit 0"],
            td.path(),
            &[],
            Duration::from_secs(10),
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn captures_stderr_on_failure() {
        let td = tempdir().expect("tempdir");
        let out = run_with_timeout(
            "sh",
            &["-c", "echo oops >&2; exit 3"],
            td.path(),
            &[],
            Duration::from_secs(10),
        )
        .expect("run");
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn kills_processes_that_exceed_the_timeout() {
        let td = tempdir().expect("tempdir");
        let out = run_with_timeout(
            "sh",
            &["-c", "sleep 30"],
            td.path(),
            &[],
            Duration::from_millis(200),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.duration < Duration::from_secs(10));
    }

    #[test]
    fn passes_environment_to_the_child() {
        let td = tempdir().expect("tempdir");
        let out = run_with_timeout(
            "sh",
            &["-c", "echo $CONVEYOR_TEST_MARKER"],
            td.path(),
            &[("CONVEYOR_TEST_MARKER", "marked")],
            Duration::from_secs(10),
        )
        .expect("run");
        assert_eq!(out.stdout.trim(), "marked");
    }

    #[test]
    fn combined_joins_both_streams() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "out line".to_string(),
            stderr: "err line".to_string(),
            timed_out: false,
            duration: Duration::ZERO,
        };
        assert_eq!(out.combined(), "out line\nerr line");
    }
}
