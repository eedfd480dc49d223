//! Engine process supervision.
//!
//! [`Supervisor::run`] spawns the engine with an explicit argument vector,
//! streams its stdout through the block splitter into a [`ProgressSink`],
//! polls the job's persisted status for cancellation, and terminates the
//! process (SIGTERM, then SIGKILL after a grace period) when the job is
//! cancelled or the server is shutting down.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crackq_core::engine_output::{parse_status_block, BlockSplitter, StatusSample};
use crackq_core::scheduling::state_machine;
use crackq_core::types::DbId;
use crackq_db::store::Store;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

/// Bytes of stderr kept for error reporting.
pub const STDERR_TAIL_BYTES: usize = 4096;

const READ_CHUNK_BYTES: usize = 8192;

/// How long to keep reading stdout after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives parsed status samples while the engine runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn sample(&self, sample: StatusSample);
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own. `code` is `None` when it died by signal.
    Exited {
        code: Option<i32>,
        stderr_tail: String,
    },
    /// The job was cancelled (or deleted) and the process was terminated.
    Cancelled,
    /// The server is shutting down and the process was terminated.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn engine: {0}")]
    Spawn(#[source] io::Error),

    #[error("Engine I/O error: {0}")]
    Io(#[source] io::Error),
}

enum Stop {
    Exited(ExitStatus),
    Cancelled,
    Shutdown,
}

pub struct Supervisor {
    store: Arc<dyn Store>,
    program: PathBuf,
    block_delimiter: String,
    cancel_poll: Duration,
    terminate_grace: Duration,
}

impl Supervisor {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            store,
            program: config.engine_bin.clone(),
            block_delimiter: config.block_delimiter.clone(),
            cancel_poll: config.cancel_poll,
            terminate_grace: config.terminate_grace,
        }
    }

    /// Run the engine until it exits, the job is cancelled, or the server
    /// shuts down.
    pub async fn run(
        &self,
        job_id: DbId,
        args: Vec<OsString>,
        sink: &dyn ProgressSink,
        shutdown: &CancellationToken,
    ) -> Result<RunOutcome, SupervisorError> {
        // A cancel that landed after admission must not reach the engine.
        match self.store.job_status(job_id).await {
            Ok(Some(state_machine::CANCELLED)) | Ok(None) => {
                tracing::info!(job_id, "Job cancelled before engine start");
                return Ok(RunOutcome::Cancelled);
            }
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Pre-spawn status check failed");
            }
        }
        if shutdown.is_cancelled() {
            return Ok(RunOutcome::Shutdown);
        }

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        tracing::info!(
            job_id,
            pid = child.id(),
            program = %self.program.display(),
            "Engine process started",
        );

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Io(io::Error::other("stdout not captured")))?;
        let stderr_task = tokio::spawn(read_tail(child.stderr.take()));

        let mut splitter = BlockSplitter::new(self.block_delimiter.clone());
        let mut carry = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut stdout_open = true;

        let mut poll = tokio::time::interval(self.cancel_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        poll.tick().await;

        let stop = loop {
            tokio::select! {
                read = stdout.read(&mut buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => {
                        let text = decode_utf8(&mut carry, &buf[..n]);
                        for block in splitter.push(&text) {
                            emit(sink, &block).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Engine stdout read failed");
                        stdout_open = false;
                    }
                },
                status = child.wait() => break Stop::Exited(status.map_err(SupervisorError::Io)?),
                _ = poll.tick() => match self.store.job_status(job_id).await {
                    Ok(Some(state_machine::CANCELLED)) | Ok(None) => break Stop::Cancelled,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Cancellation poll failed");
                    }
                },
                _ = shutdown.cancelled() => break Stop::Shutdown,
            }
        };

        match stop {
            Stop::Exited(status) => {
                if stdout_open {
                    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                        let mut rest = Vec::new();
                        let _ = stdout.read_to_end(&mut rest).await;
                        rest
                    })
                    .await
                    .unwrap_or_default();
                    let text = decode_utf8(&mut carry, &drained);
                    for block in splitter.push(&text) {
                        emit(sink, &block).await;
                    }
                }
                if !carry.is_empty() {
                    let text = String::from_utf8_lossy(&carry).into_owned();
                    for block in splitter.push(&text) {
                        emit(sink, &block).await;
                    }
                }
                if let Some(block) = splitter.finish() {
                    emit(sink, &block).await;
                }

                let stderr_tail = tokio::time::timeout(DRAIN_TIMEOUT, stderr_task)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default();
                tracing::info!(job_id, code = status.code(), "Engine process exited");
                Ok(RunOutcome::Exited {
                    code: status.code(),
                    stderr_tail,
                })
            }
            Stop::Cancelled => {
                tracing::info!(job_id, "Job cancelled, terminating engine");
                self.terminate(job_id, &mut child).await;
                stderr_task.abort();
                Ok(RunOutcome::Cancelled)
            }
            Stop::Shutdown => {
                tracing::info!(job_id, "Shutting down, terminating engine");
                self.terminate(job_id, &mut child).await;
                stderr_task.abort();
                Ok(RunOutcome::Shutdown)
            }
        }
    }

    /// SIGTERM, wait for the grace period, then SIGKILL.
    async fn terminate(&self, job_id: DbId, child: &mut Child) {
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(job_id, pid, error = %e, "SIGTERM failed");
            }
            match tokio::time::timeout(self.terminate_grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => {
                    tracing::warn!(
                        job_id,
                        pid,
                        grace_ms = self.terminate_grace.as_millis() as u64,
                        "Engine ignored SIGTERM, killing",
                    );
                }
            }
        }
        if let Err(e) = child.kill().await {
            tracing::warn!(job_id, error = %e, "Failed to kill engine process");
        }
    }
}

async fn emit(sink: &dyn ProgressSink, block: &str) {
    let sample = parse_status_block(block);
    if !sample.is_empty() {
        sink.sample(sample).await;
    }
}

/// Decode a chunk, holding back an incomplete trailing UTF-8 sequence
/// until the next chunk arrives.
fn decode_utf8(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    let valid_up_to = match std::str::from_utf8(carry.as_slice()) {
        Ok(_) => carry.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes mid-stream: decode lossily and move on.
        Err(_) => carry.len(),
    };
    let rest = carry.split_off(valid_up_to);
    let text = String::from_utf8_lossy(carry.as_slice()).into_owned();
    *carry = rest;
    text
}

/// Read a stream to the end, keeping only its last [`STDERR_TAIL_BYTES`].
async fn read_tail<R: AsyncRead + Unpin>(handle: Option<R>) -> String {
    let mut tail = Vec::new();
    if let Some(mut h) = handle {
        let mut buf = [0u8; 1024];
        loop {
            match h.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let excess = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
