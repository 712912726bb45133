//! Delayed-task queue with at-least-once delivery.
//!
//! Tasks are enqueued transactionally through the datastore (see
//! [`crate::datastore::Txn::enqueue`]) and dispatched here. A failed
//! task is redelivered with capped exponential backoff until its
//! handler succeeds, so every handler must be idempotent: job
//! processing is a pure function of persisted state, and instance
//! termination is idempotent on the provider side.
//!
//! There is deliberately no delivery cap here. Deciding when to stop is
//! the driver's job: the liveness check gives up against the launch
//! clock and repeated dream failures fail the job outright (see
//! `job::state`), and both conclusions enqueue the instance's
//! termination. A queue-side cap would instead strand a job mid-state
//! with its instance still running and billing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::error::Result;
use crate::job;

/// A named task with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCall {
    ProcessJob { job_id: String },
    TerminateInstance { instance_id: String },
}

/// Accepts tasks for later execution. The datastore holds one of these
/// so transactionally-enqueued tasks can be submitted on commit.
pub trait TaskSink: Send + Sync {
    fn submit(&self, call: TaskCall);
}

#[derive(Debug)]
struct Envelope {
    call: TaskCall,
    attempt: u32,
}

/// Clonable enqueue handle for the task queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiving half, consumed by [`run_dispatcher`].
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl TaskQueue {
    pub fn channel() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }

    fn resubmit(&self, call: TaskCall, attempt: u32) {
        if self.tx.send(Envelope { call, attempt }).is_err() {
            tracing::warn!("Task queue is shut down, dropping redelivery");
        }
    }
}

impl TaskSink for TaskQueue {
    fn submit(&self, call: TaskCall) {
        if self.tx.send(Envelope { call, attempt: 0 }).is_err() {
            tracing::warn!("Task queue is shut down, dropping task");
        }
    }
}

/// Dispatch loop. Each received task runs on its own tokio task so a
/// long dream request does not block other jobs.
pub async fn run_dispatcher(
    app: Arc<App>,
    mut receiver: TaskReceiver,
    queue: TaskQueue,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Task dispatcher shutting down");
                break;
            }
            envelope = receiver.rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        tokio::spawn(deliver(app.clone(), queue.clone(), envelope));
                    }
                    None => break,
                }
            }
        }
    }
}

async fn deliver(app: Arc<App>, queue: TaskQueue, envelope: Envelope) {
    if let Err(err) = dispatch(&app, &envelope.call).await {
        let attempt = envelope.attempt.saturating_add(1);
        let delay = backoff(attempt);
        tracing::warn!(
            call = ?envelope.call,
            attempt,
            delay_secs = delay.as_secs(),
            error = %err,
            "Task failed, scheduling redelivery"
        );
        tokio::time::sleep(delay).await;
        queue.resubmit(envelope.call, attempt);
    }
}

async fn dispatch(app: &App, call: &TaskCall) -> Result<()> {
    match call {
        TaskCall::ProcessJob { job_id } => job::process_job(app, job_id).await,
        TaskCall::TerminateInstance { instance_id } => {
            job::terminate_instance(app, instance_id).await
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(20), Duration::from_secs(64));
    }
}
