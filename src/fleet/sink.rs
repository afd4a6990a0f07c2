//! Serialization of task results into one response stream.
//!
//! The sink is the only writer of the response. Tasks hand it whole
//! [`TaskResult`]s over a channel and it writes each as one contiguous block,
//! so output of concurrent scripts never interleaves.

use std::collections::BTreeMap;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::TaskError;
use super::types::{CleanupOutcome, TaskResult};

/// Written after the last block.
pub const TRAILER: &[u8] = b"\n#EOF\n";

/// Order in which blocks are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkOrder {
    /// As tasks finish.
    #[default]
    Completion,
    /// In script-list order; early finishers wait for their predecessors.
    ScriptList,
}

/// Totals of one drained run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub received: usize,
    pub failed: usize,
    pub cleanup_failed: usize,
}

pub struct ResultSink<W> {
    writer: W,
    order: SinkOrder,
    cancel: CancellationToken,
    write_error: Option<io::Error>,
}

impl<W: AsyncWrite + Unpin> ResultSink<W> {
    /// `cancel` is triggered if writing to `writer` fails.
    pub fn new(writer: W, order: SinkOrder, cancel: CancellationToken) -> Self {
        Self {
            writer,
            order,
            cancel,
            write_error: None,
        }
    }

    /// Write every result from `results`, then the trailer.
    ///
    /// Keeps receiving after a write failure so the producing tasks can
    /// finish their cleanup; the first write error is returned at the end.
    pub async fn drain(mut self, mut results: mpsc::Receiver<TaskResult>) -> io::Result<SinkReport> {
        let mut report = SinkReport::default();
        let mut held: BTreeMap<usize, TaskResult> = BTreeMap::new();
        let mut next_index = 0;

        while let Some(result) = results.recv().await {
            report.received += 1;
            if !result.is_success() {
                report.failed += 1;
            }
            if matches!(result.cleanup, CleanupOutcome::Failed(_)) {
                report.cleanup_failed += 1;
            }

            match self.order {
                SinkOrder::Completion => self.emit(&result).await,
                SinkOrder::ScriptList => {
                    held.insert(result.job.index, result);
                    while let Some(ready) = held.remove(&next_index) {
                        self.emit(&ready).await;
                        next_index += 1;
                    }
                }
            }
        }

        // Gaps in the index sequence leave results behind; write them in order
        for result in held.into_values() {
            self.emit(&result).await;
        }

        self.write(TRAILER).await;
        if self.write_error.is_none()
            && let Err(e) = self.writer.shutdown().await
        {
            self.write_error = Some(e);
        }

        debug!(
            "Result sink drained {} result(s), {} failed",
            report.received, report.failed
        );
        match self.write_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn emit(&mut self, result: &TaskResult) {
        let block = render_block(result);
        self.write(&block).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        if self.write_error.is_some() {
            return;
        }
        let written = match self.writer.write_all(bytes).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Response writer failed, cancelling remaining scripts: {}", e);
            self.cancel.cancel();
            self.write_error = Some(e);
        }
    }
}

/// Render one result as its response block.
pub fn render_block(result: &TaskResult) -> Vec<u8> {
    let job = &result.job;
    let mut block = Vec::with_capacity(result.stdout.len() + result.stderr.len() + 128);

    match &result.error {
        None => {
            block.extend_from_slice(&result.stdout);
            block.push(b'\n');
        }
        Some(TaskError::Execute(cause)) => {
            block.extend_from_slice(
                format!(
                    "Failed to run script_file {} ({}):\nERROR: {}\n",
                    job.remote_path,
                    job.local_path.display(),
                    cause
                )
                .as_bytes(),
            );
            block.extend_from_slice(&result.stdout);
            block.extend_from_slice(&result.stderr);
            block.push(b'\n');
        }
        Some(TaskError::Transfer(cause)) => {
            block.extend_from_slice(
                format!(
                    "Failed to upload script_file {} to {}:\nERROR: {}\n",
                    job.local_path.display(),
                    job.remote_path,
                    cause
                )
                .as_bytes(),
            );
        }
        Some(cause) => {
            block.extend_from_slice(
                format!(
                    "Script {} {}:\nERROR: {}\n",
                    job.local_path.display(),
                    result.state(),
                    cause
                )
                .as_bytes(),
            );
            if !result.stdout.is_empty() || !result.stderr.is_empty() {
                block.extend_from_slice(&result.stdout);
                block.extend_from_slice(&result.stderr);
                block.push(b'\n');
            }
        }
    }

    if let CleanupOutcome::Failed(cause) = &result.cleanup {
        block.extend_from_slice(
            format!("Failed to remove {}:\nERROR: {}\n", job.remote_path, cause).as_bytes(),
        );
    }

    block
}
