//! ShellExecutor - `sh -c <command>` via tokio::process
//!
//! stdout / stderr は行単位で `OutputSink` に流す。失敗時のメッセージには
//! stderr の末尾を添える。

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::{Job, JobId};
use crate::error::{Result, SpindleError};
use crate::ports::{Executor, OutputChunk, OutputSink, OutputStream};

/// Stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Option<Duration>,
    output: Option<OutputSink>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: None,
            output: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Kill the process and fail the job after `timeout`. `None`: unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.output = Some(sink);
        self
    }

    fn pump<R>(&self, reader: Option<R>, job_id: &JobId, stream: OutputStream, keep: usize) -> JoinHandle<Vec<String>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.output.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(keep);
            let Some(reader) = reader else {
                return Vec::new();
            };
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                if let Some(sink) = &sink {
                    // receiver gone: keep draining so the child never blocks
                    let _ = sink.send(OutputChunk {
                        job_id: job_id.clone(),
                        stream,
                        line,
                    });
                }
            }
            tail.into()
        })
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, job: &Job) -> Result<()> {
        info!(job_id = %job.id(), command = job.command(), "executing job");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(job.command())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpindleError::Execution(format!("failed to spawn {}: {e}", self.shell)))?;

        let mut stdout = self.pump(child.stdout.take(), job.id(), OutputStream::Stdout, 0);
        let mut stderr = self.pump(child.stderr.take(), job.id(), OutputStream::Stderr, STDERR_TAIL_LINES);

        // Exit alone is not the end: background grandchildren may hold the
        // pipes open, so the deadline also covers draining them.
        let finished = async {
            let status = child.wait().await?;
            let _ = (&mut stdout).await;
            let tail = (&mut stderr).await.unwrap_or_default();
            Ok::<_, SpindleError>((status, tail))
        };

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.map_err(|_| limit),
            None => Ok(finished.await),
        };
        let (status, tail) = match outcome {
            Ok(done) => done?,
            Err(limit) => {
                if matches!(child.try_wait(), Ok(None))
                    && let Err(e) = child.kill().await
                {
                    warn!(job_id = %job.id(), error = %e, "failed to kill timed out job");
                }
                stdout.abort();
                stderr.abort();
                let message = format!("timed out after {}s", limit.as_secs_f64());
                warn!(job_id = %job.id(), "{message}");
                return Err(SpindleError::Execution(message));
            }
        };

        if status.success() {
            info!(job_id = %job.id(), "job succeeded");
            return Ok(());
        }
        let message = failure_message(status, &tail);
        warn!(job_id = %job.id(), error = %message, "job failed");
        Err(SpindleError::Execution(message))
    }
}

fn failure_message(status: ExitStatus, stderr_tail: &[String]) -> String {
    let Some(code) = status.code() else {
        return "terminated by signal".to_string();
    };
    let tail = stderr_tail.join("\n");
    let tail = tail.trim();
    if tail.is_empty() {
        format!("exit code {code}")
    } else {
        format!("exit code {code}: {tail}")
    }
}
