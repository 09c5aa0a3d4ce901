//! Isolated execution of lifecycle steps.
//!
//! A [`StepRunner`] owns a worker thread reached only through an explicit
//! channel pair. Every request carries its own reply sender, so each
//! `execute` or `cancel` gets exactly one response. The worker runs each step
//! on a dedicated thread and keeps serving `cancel` while it is in flight; a
//! hung step can be abandoned by timeout without blocking the orchestrator.

mod protocol;
mod worker;

use std::error::Error;
use std::fmt;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::loader::MigrationSource;
use crate::migration::{MigrationContext, StepName, StepResult};

pub use protocol::{channel, WorkerChannel, WorkerMessage, WorkerPort, WorkerResponse};

/// Longest [`CancelHandle::cancel`] waits for the worker to acknowledge.
pub const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum RunnerError {
    Spawn(std::io::Error),
    Disconnected,
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::Spawn(err) => write!(f, "unable to start migration worker: {}", err),
            RunnerError::Disconnected => write!(f, "migration worker is not running"),
        }
    }
}

impl Error for RunnerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunnerError::Spawn(err) => Some(err),
            RunnerError::Disconnected => None,
        }
    }
}

type ChannelSlot = Arc<Mutex<Option<WorkerChannel>>>;

pub struct StepRunner {
    source: Arc<dyn MigrationSource>,
    channel: ChannelSlot,
    timeout: Option<Duration>,
}

impl StepRunner {
    /// Creates a runner; the worker thread starts on first use.
    pub fn new(source: Arc<dyn MigrationSource>) -> Self {
        Self {
            source,
            channel: Arc::new(Mutex::new(None)),
            timeout: None,
        }
    }

    /// Creates a runner around an already-connected channel whose port is
    /// served by [`StepRunner::serve`] or by a custom worker.
    pub fn with_channel(source: Arc<dyn MigrationSource>, channel: WorkerChannel) -> Self {
        Self {
            source,
            channel: Arc::new(Mutex::new(Some(channel))),
            timeout: None,
        }
    }

    /// Serves `port` with the standard worker loop on a new thread.
    pub fn serve(port: WorkerPort, source: Arc<dyn MigrationSource>) -> Result<(), RunnerError> {
        worker::spawn(port, source)
            .map(|_| ())
            .map_err(RunnerError::Spawn)
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            channel: Arc::clone(&self.channel),
        }
    }

    /// Runs `step` of the migration at `migration_path` in the worker and
    /// waits for its result.
    pub fn start(
        &mut self,
        migration_path: &str,
        step: StepName,
        ctx: &MigrationContext,
    ) -> StepResult {
        let channel = match self.ensure_worker() {
            Ok(channel) => channel,
            Err(err) => return StepResult::failed(err.to_string()),
        };

        let message = WorkerMessage::Execute {
            migration_path: migration_path.to_string(),
            step_name: step.as_str().to_string(),
            context: ctx.clone(),
        };
        let response = match channel.request(message) {
            Ok(response) => response,
            Err(err) => {
                self.retire_worker();
                return StepResult::failed(err.to_string());
            }
        };

        let received = match self.timeout {
            None => response.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(limit) => response.recv_timeout(limit),
        };

        match received {
            Ok(reply) => reply.into_step_result(),
            Err(RecvTimeoutError::Timeout) => {
                let limit = self.timeout.unwrap_or_default();
                tracing::error!(
                    path = migration_path,
                    step = %step,
                    seconds = limit.as_secs_f64(),
                    "step timed out; abandoning worker"
                );
                self.cancel_handle().request_cancel(Duration::ZERO);
                self.retire_worker();
                StepResult::failed(format!("Step timed out after {}s", limit.as_secs_f64()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.retire_worker();
                StepResult::failed("migration worker exited without a response")
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    fn ensure_worker(&mut self) -> Result<WorkerChannel, RunnerError> {
        let mut slot = lock(&self.channel);
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }
        let (channel, port) = protocol::channel();
        Self::serve(port, Arc::clone(&self.source))?;
        tracing::debug!("migration worker started");
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Drops the orchestrator end; the old worker exits once its step returns.
    fn retire_worker(&mut self) {
        lock(&self.channel).take();
    }
}

impl Drop for StepRunner {
    fn drop(&mut self) {
        self.retire_worker();
    }
}

/// Cloneable handle that cancels whatever step the runner has in flight.
#[derive(Clone)]
pub struct CancelHandle {
    channel: ChannelSlot,
}

impl CancelHandle {
    /// Best-effort: sets the in-flight step's token and fires the migration's
    /// cancel hook once. Waits at most [`CANCEL_ACK_TIMEOUT`] for the hook.
    pub fn cancel(&self) {
        self.request_cancel(CANCEL_ACK_TIMEOUT);
    }

    fn request_cancel(&self, wait: Duration) {
        let Some(channel) = lock(&self.channel).clone() else {
            return;
        };
        let response = match channel.request(WorkerMessage::Cancel) {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "cancel found no running worker");
                return;
            }
        };
        if wait.is_zero() {
            return;
        }
        match response.recv_timeout(wait) {
            Ok(reply) => tracing::debug!(?reply, "worker acknowledged cancellation"),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    seconds = wait.as_secs_f64(),
                    "cancel hook still running; no longer waiting for it"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {}
        }
    }
}

fn lock(slot: &ChannelSlot) -> std::sync::MutexGuard<'_, Option<WorkerChannel>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
