//! Executor port - ジョブのコマンドを実際に走らせる側
//!
//! Contract: `execute(job)` returns `Ok(())` on success, or
//! `Err(SpindleError::Execution(..))` for a non-zero exit, a signal, or a
//! timeout. The executor enforces its own timeout.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{Job, JobId};
use crate::error::Result;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of output, tagged with the job that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub job_id: JobId,
    pub stream: OutputStream,
    pub line: String,
}

/// Receiver side is owned by whoever wants the output (CLI, tests).
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;
