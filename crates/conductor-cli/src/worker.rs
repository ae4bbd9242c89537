use conductor_core::Payload;
use conductor_orchestrator::{Assignment, ChannelDispatcher, Orchestrator, WorkerMessage, WorkerSpec};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connect and register one in-process worker per spec.
pub async fn spawn_pool(
    orchestrator: &Arc<Orchestrator>,
    dispatcher: &ChannelDispatcher,
    specs: Vec<WorkerSpec>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
        let inbox = dispatcher.connect(spec.id.clone());
        handles.push(tokio::spawn(run_worker(Arc::clone(orchestrator), inbox)));
        info!(worker = %spec.id, capacity = spec.capacity, "Starting local worker");
        orchestrator.register_worker(spec).await?;
    }
    Ok(handles)
}

/// Echo worker: completes every assignment with its own input.
async fn run_worker(orchestrator: Arc<Orchestrator>, mut inbox: mpsc::Receiver<WorkerMessage>) {
    while let Some(message) = inbox.recv().await {
        match message {
            WorkerMessage::Run(assignment) => {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    let attempt = assignment.attempt_ref();
                    let task_id = attempt.task_id;
                    let output = echo(&assignment);
                    match orchestrator.complete_execution(&attempt, output).await {
                        Ok(true) => {}
                        Ok(false) => debug!(task_id = %task_id, "Result arrived after the task ended"),
                        Err(e) => warn!(task_id = %task_id, error = %e, "Result was not accepted"),
                    }
                });
            }
            WorkerMessage::Cancel { task_id } => {
                debug!(task_id = %task_id, "Cancellation received");
            }
        }
    }
}

fn echo(assignment: &Assignment) -> Payload {
    let mut output: Payload = assignment
        .task
        .input
        .iter()
        .filter(|(key, _)| key.as_str() != "context")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    output.insert("task".into(), serde_json::json!(assignment.task.name));
    output.insert("worker".into(), serde_json::json!(assignment.worker_id));
    output.insert("attempt".into(), serde_json::json!(assignment.attempt));
    output
}
