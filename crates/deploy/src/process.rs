//! External command execution.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Trimmed stderr, or the exit status when stderr is empty.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exited with {}", self.status)
        } else {
            stderr.to_string()
        }
    }
}

/// Run `program` to completion, optionally feeding `stdin`.
pub async fn run(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    cwd: Option<&Path>,
) -> Result<CommandOutput> {
    tracing::trace!(program, ?args, "Running command");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn `{}`", program))?;

    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().context("Child stdin was not captured")?;
        pipe.write_all(input.as_bytes())
            .await
            .with_context(|| format!("Failed to write stdin of `{}`", program))?;
        // Closing stdin lets the child see EOF.
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("Failed to wait for `{}`", program))?;

    let output = CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    tracing::debug!(program, status = %output.status, "Command completed");
    Ok(output)
}

/// Run `program` and fail unless it exits successfully. Returns stdout.
pub async fn run_checked(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    cwd: Option<&Path>,
) -> Result<String> {
    let output = run(program, args, stdin, cwd).await?;
    if !output.status.success() {
        anyhow::bail!("`{}` failed: {}", program, output.failure_reason());
    }
    Ok(output.stdout)
}

/// Split a shell-style command line into program and arguments.
pub fn split_command(line: &str) -> Result<(String, Vec<String>)> {
    let mut words = shell_words::split(line)
        .with_context(|| format!("Failed to parse command line `{}`", line))?
        .into_iter();
    let program = words.next().context("Command line is empty")?;
    Ok((program, words.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("pytest -q 'tests/test main.py'").unwrap();
        assert_eq!(program, "pytest");
        assert_eq!(args, vec!["-q".to_string(), "tests/test main.py".to_string()]);
        assert!(split_command("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let out = run_checked("cat", &[], Some("hello"), None).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let err = run_checked("sh", &["-c".to_string(), "echo boom >&2; exit 3".to_string()], None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
