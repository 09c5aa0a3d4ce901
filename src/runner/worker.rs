use std::str::FromStr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::protocol::{Request, WorkerMessage, WorkerPort, WorkerResponse};
use crate::cancel::CancellationToken;
use crate::loader::MigrationSource;
use crate::migration::{
    execute_step, invoke_cancel_hook, Migration, MigrationContext, StepName, StepResult,
};

struct Inflight {
    token: CancellationToken,
    migration: Arc<dyn Migration>,
    hook_fired: bool,
}

type InflightSlot = Arc<Mutex<Option<Inflight>>>;

/// Starts the worker loop. It runs until every `WorkerChannel` is dropped.
pub(crate) fn spawn(
    port: WorkerPort,
    source: Arc<dyn MigrationSource>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("migration-worker".to_string())
        .spawn(move || run(port, source))
}

fn run(port: WorkerPort, source: Arc<dyn MigrationSource>) {
    let inflight: InflightSlot = Arc::new(Mutex::new(None));
    for Request { message, reply } in port.requests.iter() {
        match message {
            WorkerMessage::Execute {
                migration_path,
                step_name,
                context,
            } => execute(&source, &inflight, &migration_path, &step_name, context, reply),
            WorkerMessage::Cancel => cancel(&inflight, reply),
        }
    }
    tracing::debug!("migration worker channel closed");
}

fn execute(
    source: &Arc<dyn MigrationSource>,
    inflight: &InflightSlot,
    migration_path: &str,
    step_name: &str,
    mut context: MigrationContext,
    reply: Sender<WorkerResponse>,
) {
    if lock(inflight).is_some() {
        respond(
            &reply,
            WorkerResponse::Error {
                error: "worker is already executing a step".to_string(),
            },
        );
        return;
    }

    let step = match StepName::from_str(step_name) {
        Ok(step) => step,
        Err(err) => {
            respond(
                &reply,
                WorkerResponse::Result {
                    result: StepResult::failed(err.to_string()),
                },
            );
            return;
        }
    };

    let Some(migration) = source.load_path(migration_path) else {
        respond(
            &reply,
            WorkerResponse::Error {
                error: format!("Failed to load migration from {}", migration_path),
            },
        );
        return;
    };

    context.cancellation = CancellationToken::new();
    *lock(inflight) = Some(Inflight {
        token: context.cancellation.clone(),
        migration: Arc::clone(&migration),
        hook_fired: false,
    });

    let slot = Arc::clone(inflight);
    let version = migration.version();
    let spawned = thread::Builder::new()
        .name(format!("migration-step-v{version}"))
        .spawn({
            let reply = reply.clone();
            move || {
                tracing::debug!(version, step = %step, "worker executing step");
                let result = execute_step(migration.as_ref(), step, &context);
                lock(&slot).take();
                respond(&reply, WorkerResponse::Result { result });
            }
        });

    if let Err(err) = spawned {
        lock(inflight).take();
        respond(
            &reply,
            WorkerResponse::Error {
                error: format!("unable to start step thread: {}", err),
            },
        );
    }
}

fn cancel(inflight: &InflightSlot, reply: Sender<WorkerResponse>) {
    let hook = {
        let mut guard = lock(inflight);
        match guard.as_mut() {
            Some(current) => {
                current.token.cancel();
                if current.hook_fired {
                    None
                } else {
                    current.hook_fired = true;
                    Some(Arc::clone(&current.migration))
                }
            }
            None => None,
        }
    };

    let Some(migration) = hook else {
        respond(
            &reply,
            WorkerResponse::Result {
                result: StepResult::cancelled(),
            },
        );
        return;
    };

    // The hook runs off the loop thread so a slow hook never stalls the worker.
    let version = migration.version();
    let ack = reply.clone();
    let spawned = thread::Builder::new()
        .name(format!("migration-cancel-v{version}"))
        .spawn(move || {
            tracing::info!(version, "invoking migration cancel hook");
            invoke_cancel_hook(migration.as_ref());
            respond(
                &ack,
                WorkerResponse::Result {
                    result: StepResult::cancelled(),
                },
            );
        });
    if let Err(err) = spawned {
        tracing::warn!(version, error = %err, "unable to start cancel hook thread");
        respond(
            &reply,
            WorkerResponse::Result {
                result: StepResult::cancelled(),
            },
        );
    }
}

fn respond(reply: &Sender<WorkerResponse>, response: WorkerResponse) {
    if reply.send(response).is_err() {
        tracing::debug!("orchestrator stopped waiting for worker response");
    }
}

fn lock(slot: &InflightSlot) -> std::sync::MutexGuard<'_, Option<Inflight>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
