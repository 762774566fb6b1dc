//! Command execution sandbox.
//!
//! Commands are spawned directly from an argument vector, never through a
//! shell, with a wall-clock timeout after which the child is killed. Only a
//! bounded prefix of each output stream is kept in memory; the rest is
//! drained and discarded.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::{ControlError, Result};

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Kill the process after this long.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Build a spec from an already tokenized command line.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Validation` if `argv` is empty.
    pub fn from_argv(argv: Vec<String>, cwd: PathBuf, timeout: Duration) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| ControlError::Validation("empty command".to_string()))?;
        Ok(Self {
            program,
            args: argv.collect(),
            cwd,
            env: Vec::new(),
            timeout,
        })
    }

    /// The command line, for logs and audit records.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished (or killed) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout, lossily decoded and truncated.
    pub stdout: String,
    /// Captured stderr, lossily decoded and truncated.
    pub stderr: String,
    /// Exit code; `None` when killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    /// Whether the timeout fired.
    pub timed_out: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Exit code zero within the timeout.
    #[must_use]
    pub const fn success(&self) -> bool {
        !self.timed_out && matches!(self.exit_code, Some(0))
    }

    /// stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        combine_streams(&self.stdout, &self.stderr)
    }
}

/// Join captured stdout and stderr into one log text.
pub(crate) fn combine_streams(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr),
    }
}

/// Runs commands on behalf of bridges and deployments.
#[async_trait]
pub trait CommandSandbox: Send + Sync {
    /// Run a command to completion or timeout.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Execution` if the process cannot be spawned.
    /// A non-zero exit or a timeout is a successful `CommandOutput`.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Sandbox spawning local child processes with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    max_output_bytes: usize,
}

impl ProcessSandbox {
    /// Create a sandbox that keeps at most `max_output_bytes` of each stream.
    #[must_use]
    pub const fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

/// The kept prefix of one output stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn decode(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

/// Keep the first `cap` bytes of a stream and drain the rest so the child
/// never blocks on a full pipe.
async fn read_capped<R>(stream: Option<R>, cap: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return Ok(Captured::default());
    };
    let mut bytes = Vec::new();
    (&mut stream)
        .take(u64::try_from(cap).unwrap_or(u64::MAX))
        .read_to_end(&mut bytes)
        .await?;
    let dropped = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
    Ok(Captured {
        bytes,
        truncated: dropped > 0,
    })
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl CommandSandbox for ProcessSandbox {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            ControlError::Execution(format!("failed to spawn {}: {e}", spec.program))
        })?;

        tracing::debug!(command = %spec.display(), cwd = %spec.cwd.display(), "Spawned command");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output_bytes;
        let finished = async {
            let (stdout, stderr) = tokio::try_join!(read_capped(stdout, cap), read_capped(stderr, cap))?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        };
        let waited = tokio::time::timeout(spec.timeout, finished).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match waited {
            Ok(Ok((stdout, stderr, status))) => Ok(CommandOutput {
                stdout: stdout.decode(),
                stderr: stderr.decode(),
                exit_code: status.code(),
                timed_out: false,
                duration_ms,
            }),
            Ok(Err(e)) => Err(ControlError::Execution(format!(
                "failed to wait for {}: {e}",
                spec.program
            ))),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(command = %spec.display(), error = %e, "Failed to kill timed out command");
                }
                tracing::warn!(
                    command = %spec.display(),
                    timeout_ms = %spec.timeout.as_millis(),
                    "Command timed out and was killed"
                );
                Ok(CommandOutput {
                    stderr: format!("timed out after {}s", spec.timeout.as_secs_f32()),
                    exit_code: None,
                    timed_out: true,
                    duration_ms,
                    ..CommandOutput::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(argv: &[&str], cwd: &TempDir, timeout: Duration) -> CommandSpec {
        CommandSpec::from_argv(
            argv.iter().map(ToString::to_string).collect(),
            cwd.path().to_path_buf(),
            timeout,
        )
        .unwrap()
    }

    #[test]
    fn empty_argv_is_rejected() {
        let result = CommandSpec::from_argv(Vec::new(), PathBuf::from("/"), Duration::from_secs(1));
        assert!(matches!(result, Err(ControlError::Validation(_))));
    }

    #[test]
    fn combined_output() {
        let output = CommandOutput {
            stdout: "out\n".to_string(),
            stderr: "err".to_string(),
            exit_code: Some(1),
            ..CommandOutput::default()
        };
        assert_eq!(output.combined(), "out\nerr");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();

        let output = ProcessSandbox::default()
            .run(&spec(&["ls"], &dir, Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello.txt"));
    }

    #[tokio::test]
    async fn missing_program_is_execution_error() {
        let dir = TempDir::new().unwrap();
        let result = ProcessSandbox::default()
            .run(&spec(&["definitely-not-a-real-binary-xyz"], &dir, Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(ControlError::Execution(_))));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        let output = ProcessSandbox::default()
            .run(&spec(&["sleep", "5"], &dir, Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn output_is_truncated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(100)).unwrap();

        let output = ProcessSandbox::new(10)
            .run(&spec(&["cat", "big.txt"], &dir, Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(output.stdout.starts_with("xxxxxxxxxx\n[output truncated]"));
    }

    #[tokio::test]
    async fn large_output_is_drained_not_buffered() {
        let dir = TempDir::new().unwrap();
        let output = ProcessSandbox::new(16)
            .run(&spec(
                &["head", "-c", "1048576", "/dev/zero"],
                &dir,
                Duration::from_secs(10),
            ))
            .await
            .unwrap();
        assert!(output.success());
        assert!(!output.timed_out);
        assert!(output.stdout.ends_with("[output truncated]"));
        assert!(output.stdout.len() < 64);
    }
}
