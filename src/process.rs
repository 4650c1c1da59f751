//! External process invocation
//!
//! Runs a single tool or a two-stage pipeline (producer stdout connected to
//! consumer stdin), collects exit status and diagnostic streams, and enforces
//! an optional wall-clock deadline over the whole invocation. Children are
//! spawned with `kill_on_drop`, so hitting the deadline kills every process
//! still running and discards its partial output.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// Errors raised while running an external tool
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Deadline of {deadline:?} exceeded")]
    TimedOut { deadline: Duration },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for tool invocations
pub type ToolResult<T> = Result<T, ToolError>;

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Outcome of a process that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal on unix
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    fn from_parts(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_code: status.code(),
            signal: exit_signal(status),
            stdout: String::from_utf8_lossy(stdout).to_string(),
            stderr: String::from_utf8_lossy(stderr).to_string(),
        }
    }

    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of a two-stage pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutput {
    /// The producing process; its stdout went into the pipe and is empty here
    pub producer: ToolOutput,
    /// The consuming process
    pub consumer: ToolOutput,
}

impl PipelineOutput {
    /// A pipeline succeeds when its final stage does
    pub fn success(&self) -> bool {
        self.consumer.success()
    }

    /// Both diagnostic streams, producer first
    pub fn stderr(&self) -> String {
        let mut combined = self.producer.stderr.clone();
        if !combined.is_empty() && !self.consumer.stderr.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&self.consumer.stderr);
        combined
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> ToolResult<T>
where
    F: std::future::Future<Output = ToolResult<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| ToolError::TimedOut { deadline })?,
        None => fut.await,
    }
}

async fn read_stream<R>(stream: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Run a single tool and capture its output
pub async fn run_tool(tool: &ToolCommand, deadline: Option<Duration>) -> ToolResult<ToolOutput> {
    debug!("Executing: {}", tool);

    let child = tool
        .command()
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| tool.spawn_error(e))?;

    let run = async move {
        let output = child.wait_with_output().await.map_err(|e| ToolError::Io {
            context: "waiting for process".to_string(),
            source: e,
        })?;
        Ok(ToolOutput::from_parts(
            output.status,
            &output.stdout,
            &output.stderr,
        ))
    };

    with_deadline(deadline, run).await
}

/// Run `producer | consumer` and capture both processes' outcomes
///
/// The deadline covers the whole pipeline. The consumer's exit status decides
/// success; the producer's status and stderr are kept for diagnostics.
pub async fn run_pipeline(
    producer: &ToolCommand,
    consumer: &ToolCommand,
    deadline: Option<Duration>,
) -> ToolResult<PipelineOutput> {
    debug!("Executing: {} | {}", producer, consumer);

    let mut producer_child = producer
        .command()
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| producer.spawn_error(e))?;

    let pipe: Stdio = producer_child
        .stdout
        .take()
        .ok_or_else(|| ToolError::Io {
            context: format!("taking stdout of {}", producer.program),
            source: std::io::Error::other("stdout not piped"),
        })?
        .try_into()
        .map_err(|e| ToolError::Io {
            context: "connecting pipeline".to_string(),
            source: e,
        })?;

    let consumer_child = consumer
        .command()
        .stdin(pipe)
        .spawn()
        .map_err(|e| consumer.spawn_error(e))?;

    let producer_stderr = producer_child.stderr.take();

    let run = async move {
        let (consumer_result, producer_status, producer_err) = tokio::join!(
            consumer_child.wait_with_output(),
            producer_child.wait(),
            read_stream(producer_stderr),
        );

        let io = |context: &str, source| ToolError::Io {
            context: context.to_string(),
            source,
        };
        let consumer_output = consumer_result.map_err(|e| io("waiting for consumer", e))?;
        let producer_status = producer_status.map_err(|e| io("waiting for producer", e))?;
        let producer_err = producer_err.map_err(|e| io("reading producer stderr", e))?;

        Ok(PipelineOutput {
            producer: ToolOutput::from_parts(producer_status, &[], &producer_err),
            consumer: ToolOutput::from_parts(
                consumer_output.status,
                &consumer_output.stdout,
                &consumer_output.stderr,
            ),
        })
    };

    with_deadline(deadline, run).await
}
