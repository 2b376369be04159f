//! Stage process supervision.

use crate::cancellation::CancellationToken;
use crate::errors::SketchflowError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long to keep draining output pipes after the process is gone.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to launch one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInvocation {
    /// Stage id, for diagnostics.
    pub stage_id: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Working directory of the process.
    pub working_dir: PathBuf,
    /// Deadline after which the process is killed.
    pub timeout: Option<Duration>,
}

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal it did not handle.
    Signalled,
    /// Killed at the deadline.
    TimedOut(Duration),
    /// Killed because the run was cancelled.
    Cancelled,
}

impl StageExit {
    /// Returns true for exit code 0.
    #[must_use]
    pub fn success(self) -> bool {
        self == Self::Code(0)
    }

    /// Value written on the `[EXIT CODE]` log line.
    #[must_use]
    pub fn log_code(self) -> String {
        match self {
            Self::Code(code) => code.to_string(),
            Self::Signalled => "signal".to_string(),
            Self::TimedOut(_) => "timeout".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Result of supervising one stage process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageExecution {
    /// How the process ended.
    pub exit: StageExit,
    /// Interleaved stdout and stderr, in order of arrival.
    pub output: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Launches and supervises stage processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runs one stage to completion, deadline or cancellation.
    ///
    /// An `Err` means the process could not be started.
    async fn run(
        &self,
        invocation: StageInvocation,
        cancel: Arc<CancellationToken>,
    ) -> Result<StageExecution, SketchflowError>;
}

/// [`StageRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStageRunner;

impl ProcessStageRunner {
    /// Creates a new process runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Deadline(Duration),
    Cancelled,
}

#[async_trait]
impl StageRunner for ProcessStageRunner {
    async fn run(
        &self,
        invocation: StageInvocation,
        cancel: Arc<CancellationToken>,
    ) -> Result<StageExecution, SketchflowError> {
        let (program, args) = invocation.command.split_first().ok_or_else(|| {
            SketchflowError::Config(format!("stage '{}' has an empty command", invocation.stage_id))
        })?;

        let started = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(stage = %invocation.stage_id, pid = ?child.id(), "Stage process spawned");

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);
        let collector = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            lines
        });

        let timeout = invocation.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            limit = deadline => Waited::Deadline(limit),
            () = cancel.cancelled() => Waited::Cancelled,
        };

        let exit = match waited {
            Waited::Exited(status) => match status?.code() {
                Some(code) => StageExit::Code(code),
                None => StageExit::Signalled,
            },
            Waited::Deadline(limit) => {
                warn!(
                    stage = %invocation.stage_id,
                    timeout_secs = limit.as_secs(),
                    "Stage exceeded its deadline"
                );
                kill(&mut child, &invocation.stage_id).await;
                StageExit::TimedOut(limit)
            }
            Waited::Cancelled => {
                kill(&mut child, &invocation.stage_id).await;
                StageExit::Cancelled
            }
        };

        // A grandchild may still hold the pipes open.
        let lines = match tokio::time::timeout(OUTPUT_DRAIN_GRACE, collector).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                warn!(stage = %invocation.stage_id, error = %e, "Output collector failed");
                Vec::new()
            }
            Err(_) => {
                warn!(stage = %invocation.stage_id, "Output pipes still open after exit");
                Vec::new()
            }
        };

        let mut output = lines.join("\n");
        if !output.is_empty() {
            output.push('\n');
        }

        Ok(StageExecution {
            exit,
            output,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

async fn kill(child: &mut tokio::process::Child, stage: &str) {
    if let Err(e) = child.kill().await {
        warn!(stage, error = %e, "Failed to kill stage process");
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}
