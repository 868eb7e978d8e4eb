//! Blocking `git` process invocation with an optional timeout.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::GitError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of one `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `binary args...` in `dir`, returning the output whatever the exit
/// status. Only spawn failures and timeouts are errors here.
pub fn run_git(
    binary: &str,
    dir: &Path,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<GitOutput, GitError> {
    let cmdline = args.join(" ");
    debug!(cmd = %format!("git {cmdline}"), dir = %dir.display(), "running git command");

    let mut child = Command::new(binary)
        .current_dir(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_MERGE_AUTOEDIT", "no")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound(binary.to_string())
            } else {
                GitError::IoError(e)
            }
        })?;

    // Drain both pipes on their own threads so a chatty command cannot
    // fill a pipe buffer and stall while we wait on it.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(cmd = %cmdline, secs, "git command timed out");
                return Err(GitError::Timeout {
                    command: first_words(args),
                    secs,
                });
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(GitOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// Like [`run_git`], but a non-zero exit becomes [`GitError::CommandFailed`].
pub fn run_git_checked(
    binary: &str,
    dir: &Path,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<String, GitError> {
    let output = run_git(binary, dir, args, timeout)?;
    if !output.success() {
        warn!(
            cmd = %args.join(" "),
            exit_code = output.exit_code,
            stderr = %output.stderr.trim(),
            "git command failed"
        );
        return Err(GitError::CommandFailed {
            command: first_words(args),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn read_all<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Subcommand plus its first argument, for error messages.
fn first_words(args: &[&str]) -> String {
    args.iter()
        .take_while(|a| !a.starts_with('-'))
        .take(2)
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}
