//! Supervised Command Invocation
//!
//! Runs one external process per call with:
//! - an explicit argument vector (no shell interpolation)
//! - a hard timeout that kills the whole process group
//! - bounded stdout/stderr capture
//! - redaction of everything handed back to the caller

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

use super::redact::{redact_args, redact_text};

/// How long to wait for output readers after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Read buffer size for captured streams.
const READ_CHUNK: usize = 8 * 1024;

/// Longest stderr excerpt folded into a failure message.
const MESSAGE_STDERR_CHARS: usize = 240;

/// Why an invocation did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// Deadline expired; the process group was killed
    Timeout(Duration),
    /// Process ran and exited unsuccessfully (`None` when killed by a signal)
    NonZeroExit(Option<i32>),
    /// Process never started
    Spawn { retryable: bool },
}

/// Redacted result of one invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub message: String,
    pub failure: Option<FailureKind>,
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Successful output, redacting the captured streams.
    pub fn success(stdout: &str, stderr: &str) -> Self {
        Self {
            ok: true,
            stdout: redact_text(stdout),
            stderr: redact_text(stderr),
            message: "exited with status 0".to_string(),
            failure: None,
            exit_code: Some(0),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Failed output of the given kind, redacting every string.
    pub fn failed(kind: FailureKind, message: &str, stdout: &str, stderr: &str) -> Self {
        let exit_code = match kind {
            FailureKind::NonZeroExit(code) => code,
            _ => None,
        };
        Self {
            ok: false,
            stdout: redact_text(stdout),
            stderr: redact_text(stderr),
            message: redact_text(message),
            failure: Some(kind),
            exit_code,
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed: Duration::ZERO,
        }
    }

    /// True for failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.failure,
            Some(FailureKind::Timeout(_)) | Some(FailureKind::Spawn { retryable: true })
        )
    }
}

/// Boundary through which every step reaches the outside world.
#[async_trait]
pub trait CommandInvoker: Send + Sync {
    /// Runs `args` (program first) with the given timeout.
    ///
    /// Returns `Err` only when the invocation itself is invalid; runtime
    /// failures come back as `Ok` with `ok == false`.
    async fn invoke(&self, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Checks an invocation and returns the effective (capped) timeout.
pub fn validate_invocation(args: &[String], timeout: Duration, ceiling: Duration) -> Result<Duration> {
    match args.first() {
        None => return Err(EngineError::InvalidInvocation("argument list is empty".into())),
        Some(program) if program.trim().is_empty() => {
            return Err(EngineError::InvalidInvocation("program name is empty".into()))
        }
        Some(_) => {}
    }
    if timeout.is_zero() {
        return Err(EngineError::InvalidInvocation("timeout must be positive".into()));
    }
    if timeout > ceiling {
        warn!(
            "Requested timeout {:?} exceeds ceiling {:?}; capping",
            timeout, ceiling
        );
        return Ok(ceiling);
    }
    Ok(timeout)
}

/// Real subprocess supervisor built on `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    output_limit: usize,
    max_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(output_limit: usize, max_timeout: Duration) -> Self {
        Self {
            output_limit,
            max_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.output_limit_bytes, config.max_step_timeout())
    }

    fn spawn_failure(program: &str, err: std::io::Error) -> CommandOutput {
        let retryable = !matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
        );
        let message = format!("failed to start '{}': {}", program, err);
        CommandOutput::failed(FailureKind::Spawn { retryable }, &message, "", "")
    }
}

#[async_trait]
impl CommandInvoker for ProcessRunner {
    async fn invoke(&self, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let timeout = validate_invocation(args, timeout, self.max_timeout)?;
        let program = &args[0];
        debug!("Invoking (timeout {:?}): {}", timeout, redact_args(args));

        let start = Instant::now();

        let mut std_cmd = std::process::Command::new(program);
        std_cmd
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so a timeout takes down grandchildren too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut out = Self::spawn_failure(program, e);
                out.elapsed = start.elapsed();
                return Ok(out);
            }
        };

        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), self.output_limit));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), self.output_limit));

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                terminate(&mut child).await;
                let (stdout, _) = collect(stdout_task).await;
                let (stderr, _) = collect(stderr_task).await;
                let message = format!("timed out after {:?}", timeout);
                let mut out = CommandOutput::failed(
                    FailureKind::Timeout(timeout),
                    &message,
                    &stdout,
                    &stderr,
                );
                out.elapsed = start.elapsed();
                return Ok(out);
            }
        };

        let (stdout, stdout_truncated) = collect(stdout_task).await;
        let (stderr, stderr_truncated) = collect(stderr_task).await;

        let mut out = match status {
            Ok(status) if status.success() => CommandOutput::success(&stdout, &stderr),
            Ok(status) => {
                let code = status.code();
                let head = match code {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by signal".to_string(),
                };
                let detail = stderr.trim();
                let message = if detail.is_empty() {
                    head
                } else {
                    let excerpt: String = detail.chars().take(MESSAGE_STDERR_CHARS).collect();
                    format!("{}: {}", head, excerpt)
                };
                CommandOutput::failed(FailureKind::NonZeroExit(code), &message, &stdout, &stderr)
            }
            Err(e) => {
                let message = format!("failed waiting for '{}': {}", program, e);
                CommandOutput::failed(
                    FailureKind::Spawn { retryable: true },
                    &message,
                    &stdout,
                    &stderr,
                )
            }
        };
        out.stdout_truncated = stdout_truncated;
        out.stderr_truncated = stderr_truncated;
        out.elapsed = start.elapsed();

        debug!(
            "Invocation finished in {:?} (ok: {}, exit: {:?})",
            out.elapsed, out.ok, out.exit_code
        );
        Ok(out)
    }
}

/// Reads at most `limit` bytes, draining and discarding the rest.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Stopped reading process output: {}", e);
                break;
            }
        }
    }

    (kept, truncated)
}

/// Waits briefly for a reader task and decodes what it captured.
async fn collect(mut handle: JoinHandle<(Vec<u8>, bool)>) -> (String, bool) {
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok((bytes, truncated))) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (text, truncated)
        }
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            (String::new(), false)
        }
        Err(_) => {
            handle.abort();
            debug!("Output reader still blocked after {:?}; abandoning", READER_GRACE);
            (String::new(), true)
        }
    }
}

/// Kills the child's process group, then the child itself.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: killpg only sends a signal; the group id is our child's pid
            // because it was spawned with process_group(0).
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                debug!(
                    "killpg({}) failed: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Failed to kill timed-out process: {}", e);
    }
}
