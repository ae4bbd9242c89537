use async_trait::async_trait;
use conductor_core::{TaskDefinition, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Answer of a worker to a dispatched assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    Rejected(String),
}

/// Transport used to hand assignments to workers.
///
/// Dispatch is fire-and-forget: the result of the work arrives later through
/// the orchestrator's `complete_execution` / `fail_execution` callbacks.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `task` to `worker_id`.
    async fn dispatch(&self, worker_id: &str, task: &TaskDefinition, attempt: u32)
        -> DispatchOutcome;

    /// Ask the worker to stop working on `task_id`. Cooperative only.
    async fn cancel(&self, worker_id: &str, task_id: TaskId) {
        debug!(worker = %worker_id, task_id = %task_id, "Cancellation not supported by dispatcher");
    }
}

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub worker_id: String,
    pub task: TaskDefinition,
    pub attempt: u32,
}

impl Assignment {
    /// The reference a worker reports its result under.
    pub fn attempt_ref(&self) -> AttemptRef {
        AttemptRef {
            task_id: self.task.id,
            worker_id: self.worker_id.clone(),
            attempt: self.attempt,
        }
    }
}

/// One attempt of a task on one worker.
///
/// Worker results carry it, so an answer from an earlier attempt never
/// settles the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptRef {
    pub task_id: TaskId,
    pub worker_id: String,
    pub attempt: u32,
}

/// Message delivered to an in-process worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Run(Assignment),
    Cancel { task_id: TaskId },
}

/// Dispatcher backed by one bounded `tokio::mpsc` inbox per worker.
pub struct ChannelDispatcher {
    inboxes: Mutex<HashMap<String, mpsc::Sender<WorkerMessage>>>,
    buffer: usize,
}

impl ChannelDispatcher {
    /// `buffer` bounds each worker's inbox.
    pub fn new(buffer: usize) -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Open an inbox for `worker_id`, replacing any previous one.
    pub fn connect(&self, worker_id: impl Into<String>) -> mpsc::Receiver<WorkerMessage> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.inboxes.lock().insert(worker_id.into(), tx);
        rx
    }

    pub fn disconnect(&self, worker_id: &str) -> bool {
        self.inboxes.lock().remove(worker_id).is_some()
    }

    fn sender(&self, worker_id: &str) -> Option<mpsc::Sender<WorkerMessage>> {
        self.inboxes.lock().get(worker_id).cloned()
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(
        &self,
        worker_id: &str,
        task: &TaskDefinition,
        attempt: u32,
    ) -> DispatchOutcome {
        let Some(tx) = self.sender(worker_id) else {
            return DispatchOutcome::Rejected(format!("worker {worker_id} is not connected"));
        };
        let message = WorkerMessage::Run(Assignment {
            worker_id: worker_id.to_string(),
            task: task.clone(),
            attempt,
        });
        match tx.try_send(message) {
            Ok(()) => DispatchOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                DispatchOutcome::Rejected("worker inbox is full".into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnect(worker_id);
                DispatchOutcome::Rejected("worker inbox is closed".into())
            }
        }
    }

    async fn cancel(&self, worker_id: &str, task_id: TaskId) {
        let Some(tx) = self.sender(worker_id) else {
            return;
        };
        if tx.send(WorkerMessage::Cancel { task_id }).await.is_err() {
            warn!(worker = %worker_id, task_id = %task_id, "Worker gone before cancellation");
        }
    }
}
