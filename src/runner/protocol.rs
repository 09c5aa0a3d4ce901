use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};

use super::RunnerError;
use crate::migration::{MigrationContext, StepResult};

/// Orchestrator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Execute {
        #[serde(rename = "migrationPath")]
        migration_path: String,
        #[serde(rename = "stepName")]
        step_name: String,
        context: MigrationContext,
    },
    Cancel,
}

/// Worker to orchestrator. Exactly one per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerResponse {
    Result { result: StepResult },
    Error { error: String },
}

impl WorkerResponse {
    pub fn into_step_result(self) -> StepResult {
        match self {
            WorkerResponse::Result { result } => result,
            WorkerResponse::Error { error } => StepResult::failed(error),
        }
    }
}

pub(crate) struct Request {
    pub message: WorkerMessage,
    pub reply: Sender<WorkerResponse>,
}

/// Orchestrator end of a runner's channel pair.
#[derive(Clone)]
pub struct WorkerChannel {
    requests: Sender<Request>,
}

/// Worker end of a runner's channel pair.
pub struct WorkerPort {
    pub(crate) requests: Receiver<Request>,
}

pub fn channel() -> (WorkerChannel, WorkerPort) {
    let (requests, port) = mpsc::channel();
    (
        WorkerChannel { requests },
        WorkerPort { requests: port },
    )
}

impl WorkerChannel {
    /// Sends `message`; the returned receiver yields its single response.
    pub fn request(&self, message: WorkerMessage) -> Result<Receiver<WorkerResponse>, RunnerError> {
        let (reply, response) = mpsc::channel();
        self.requests
            .send(Request { message, reply })
            .map_err(|_| RunnerError::Disconnected)?;
        Ok(response)
    }
}
