#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::{ConductorError, Payload, TaskDefinition, TaskId, TaskStatus};
use conductor_orchestrator::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// In-process worker harness
// ---------------------------------------------------------------------------

/// Concurrency observations shared by every worker of a test.
#[derive(Default)]
struct Tracker {
    active: Mutex<HashMap<String, usize>>,
    peak_per_worker: Mutex<usize>,
    peak_total: Mutex<usize>,
    started: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<TaskId>>,
}

impl Tracker {
    fn enter(&self, worker: &str, task: &str) {
        let mut active = self.active.lock();
        let slot = active.entry(worker.to_string()).or_default();
        *slot += 1;
        let per_worker = *slot;
        let total: usize = active.values().sum();
        drop(active);

        let mut peak = self.peak_per_worker.lock();
        *peak = (*peak).max(per_worker);
        let mut peak_total = self.peak_total.lock();
        *peak_total = (*peak_total).max(total);
        self.started.lock().push(task.to_string());
    }

    fn leave(&self, worker: &str) {
        if let Some(slot) = self.active.lock().get_mut(worker) {
            *slot -= 1;
        }
    }
}

/// How a worker treats an assignment.
#[derive(Clone, Copy)]
enum Behaviour {
    /// Complete after a pause, echoing the task name.
    Complete(Duration),
    /// Fail the first attempt, then complete.
    FailFirst,
    /// Never report back.
    Hang,
}

fn spawn_worker(
    orch: Arc<Orchestrator>,
    mut inbox: mpsc::Receiver<WorkerMessage>,
    tracker: Arc<Tracker>,
    behaviour: Behaviour,
) {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            let assignment = match message {
                WorkerMessage::Run(assignment) => assignment,
                WorkerMessage::Cancel { task_id } => {
                    tracker.cancelled.lock().push(task_id);
                    continue;
                }
            };
            let orch = Arc::clone(&orch);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let attempt = assignment.attempt_ref();
                tracker.enter(&assignment.worker_id, &assignment.task.name);
                match behaviour {
                    Behaviour::Hang => return,
                    Behaviour::Complete(pause) => tokio::time::sleep(pause).await,
                    Behaviour::FailFirst => {}
                }
                tracker.leave(&assignment.worker_id);

                if matches!(behaviour, Behaviour::FailFirst) && assignment.attempt == 1 {
                    orch.fail_execution(&attempt, "transient", None).await.unwrap();
                    return;
                }
                let mut output = Payload::new();
                output.insert("ok".into(), serde_json::json!(true));
                output.insert("task".into(), serde_json::json!(assignment.task.name));
                output.insert("worker".into(), serde_json::json!(assignment.worker_id));
                orch.complete_execution(&attempt, output).await.unwrap();
            });
        }
    });
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.scheduler.retry = RetryPolicy::immediate();
    config.scheduler.timeout_check_interval_ms = 10;
    config.pump_interval_ms = 10;
    config
}

async fn pool(
    workers: &[(&str, usize)],
    behaviour: Behaviour,
) -> (Arc<Orchestrator>, Arc<Tracker>) {
    let dispatcher = Arc::new(ChannelDispatcher::new(16));
    let orch = Arc::new(
        Orchestrator::new(test_config(), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>).unwrap(),
    );
    let tracker = Arc::new(Tracker::default());
    for (id, capacity) in workers {
        let inbox = dispatcher.connect(*id);
        spawn_worker(Arc::clone(&orch), inbox, Arc::clone(&tracker), behaviour);
        orch.register_worker(WorkerSpec::new(*id, Vec::<String>::new(), *capacity).with_task_types(["x"]))
            .await
            .unwrap();
    }
    (orch, tracker)
}

// ---------------------------------------------------------------------------
// 1. Placement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_workers_three_tasks_respect_capacity() {
    let (orch, tracker) = pool(
        &[("w1", 1), ("w2", 1)],
        Behaviour::Complete(Duration::from_millis(40)),
    )
    .await;

    let ids: Vec<TaskId> = (0..3)
        .map(|i| orch.submit_task(TaskDefinition::new(format!("t{i}"), "x")).unwrap())
        .collect();
    orch.pump().await;

    let stats = orch.stats();
    assert_eq!(stats["scheduler.running"], serde_json::json!(2));
    assert_eq!(stats["scheduler.pending"], serde_json::json!(1));
    assert_eq!(stats["executor.available_capacity"], serde_json::json!(0));

    for id in &ids {
        let exec = orch.wait_for_task(*id).await.unwrap();
        assert_eq!(exec.status, TaskStatus::Completed);
    }
    assert_eq!(*tracker.peak_total.lock(), 2);
    assert_eq!(*tracker.peak_per_worker.lock(), 1);
    assert_eq!(orch.stats()["executor.in_flight"], serde_json::json!(0));
}

#[tokio::test]
async fn task_without_capable_worker_stays_pending() {
    let (orch, tracker) = pool(&[("w1", 1)], Behaviour::Complete(Duration::ZERO)).await;
    let id = orch
        .submit_task(TaskDefinition::new("render", "y"))
        .unwrap();
    orch.pump().await;

    assert_eq!(orch.scheduler().get_status(id).unwrap().status, TaskStatus::Pending);
    assert!(tracker.started.lock().is_empty());
    assert_eq!(orch.stats()["executor.no_capable_worker"], serde_json::json!(1));
}

// ---------------------------------------------------------------------------
// 2. Dependencies and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependencies_run_in_order() {
    let (orch, tracker) = pool(&[("w1", 2), ("w2", 2)], Behaviour::Complete(Duration::from_millis(5))).await;

    let fetch = TaskDefinition::new("fetch", "x");
    let parse = TaskDefinition::new("parse", "x").with_dependencies([fetch.id]);
    let store = TaskDefinition::new("store", "x").with_dependencies([parse.id]);
    let store_id = store.id;
    // Submitted out of order on purpose: forward references are allowed.
    orch.submit_task(store).unwrap();
    orch.submit_task(parse).unwrap();
    orch.submit_task(fetch).unwrap();
    orch.pump().await;

    assert_eq!(orch.wait_for_task(store_id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(tracker.started.lock().clone(), vec!["fetch", "parse", "store"]);
}

#[tokio::test]
async fn failed_attempt_is_retried() {
    let (orch, _) = pool(&[("w1", 1)], Behaviour::FailFirst).await;
    let id = orch
        .submit_task(TaskDefinition::new("flaky", "x").with_max_retries(2))
        .unwrap();
    orch.pump().await;

    let exec = orch.wait_for_task(id).await.unwrap();
    assert_eq!(exec.status, TaskStatus::Completed);
    assert_eq!(exec.attempt, 2);
    assert_eq!(exec.retry_history.len(), 1);
    assert_eq!(exec.retry_history[0].reason, "transient");
    assert_eq!(orch.stats()["scheduler.retries"], serde_json::json!(1));
}

#[tokio::test]
async fn failed_dependency_cancels_dependents() {
    let (orch, _) = pool(&[("w1", 1)], Behaviour::FailFirst).await;
    let first = TaskDefinition::new("first", "x");
    let second = TaskDefinition::new("second", "x").with_dependencies([first.id]);
    let (a, b) = (first.id, second.id);
    orch.submit_task(first).unwrap();
    orch.submit_task(second).unwrap();
    orch.pump().await;

    assert_eq!(orch.wait_for_task(a).await.unwrap().status, TaskStatus::Failed);
    assert_eq!(orch.wait_for_task(b).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn task_added_after_its_dependency_failed_is_cancelled() {
    let (orch, _) = pool(&[("w1", 1)], Behaviour::FailFirst).await;
    let first = orch.submit_task(TaskDefinition::new("first", "x")).unwrap();
    orch.pump().await;
    assert_eq!(orch.wait_for_task(first).await.unwrap().status, TaskStatus::Failed);

    let late = orch
        .submit_task(TaskDefinition::new("late", "x").with_dependencies([first]))
        .unwrap();
    let exec = tokio::time::timeout(Duration::from_secs(1), orch.wait_for_task(late))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, TaskStatus::Cancelled);
    assert!(orch.scheduler().is_done());
}

// ---------------------------------------------------------------------------
// 3. Timeouts, cancellation and late results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_task_times_out_and_late_result_is_ignored() {
    let (orch, tracker) = pool(&[("w1", 1)], Behaviour::Hang).await;
    orch.start().unwrap();
    let id = orch
        .submit_task(TaskDefinition::new("stuck", "x").with_timeout(Duration::from_millis(30)))
        .unwrap();

    let exec = tokio::time::timeout(Duration::from_secs(5), orch.wait_for_task(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, TaskStatus::TimedOut);
    let late = AttemptRef {
        task_id: id,
        worker_id: "w1".into(),
        attempt: 1,
    };
    assert!(!orch.complete_execution(&late, Payload::new()).await.unwrap());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tracker.cancelled.lock().clone(), vec![id]);
    orch.shutdown().await;
}

#[tokio::test]
async fn cancel_unknown_id_is_not_found() {
    let (orch, _) = pool(&[("w1", 1)], Behaviour::Hang).await;
    let err = orch.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ConductorError::NotFound { .. }));
}

#[tokio::test]
async fn progress_and_resource_samples_are_recorded() {
    let (orch, _) = pool(&[("w1", 1)], Behaviour::Hang).await;
    let id = orch.submit_task(TaskDefinition::new("long", "x")).unwrap();
    orch.pump().await;

    orch.report_progress(id, 40, "halfway-ish").unwrap();
    orch.report_progress(id, 250, "done").unwrap();
    orch.record_resource_sample(
        id,
        conductor_core::ResourceSample {
            cpu_percent: Some(12.5),
            memory_bytes: Some(64 << 20),
            network_bytes: None,
            at: chrono::Utc::now(),
        },
    )
    .unwrap();

    match orch.get_status(id).unwrap() {
        StatusReport::Task(exec) => {
            assert_eq!(exec.progress, 100);
            assert_eq!(exec.checkpoints.len(), 2);
            assert_eq!(exec.resource_samples.len(), 1);
        }
        other => panic!("unexpected report {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 4. Workflows over real workers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workflow_branches_on_worker_output() {
    let (orch, tracker) = pool(&[("w1", 2)], Behaviour::Complete(Duration::from_millis(1))).await;
    let wf = WorkflowBuilder::new("release")
        .task("build", TaskDefinition::new("build", "x"), NO_DEPS)
        .decision(
            "gate",
            Condition::equals("build.ok", true),
            ["deploy"],
            ["rollback"],
            ["build"],
        )
        .task("deploy", TaskDefinition::new("deploy", "x"), NO_DEPS)
        .task("rollback", TaskDefinition::new("rollback", "x"), NO_DEPS)
        .build()
        .unwrap();

    let summary = orch.run_workflow(wf, Payload::new()).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.completed_steps, 3);
    assert_eq!(summary.skipped_steps, 1);
    assert_eq!(tracker.started.lock().clone(), vec!["build", "deploy"]);
}

#[tokio::test]
async fn workflow_step_tasks_are_retired_after_the_run() {
    let (orch, _) = pool(&[("w1", 2)], Behaviour::FailFirst).await;
    let wf = WorkflowBuilder::new("fan")
        .task("a", TaskDefinition::new("a", "x").with_max_retries(1), NO_DEPS)
        .task("b", TaskDefinition::new("b", "x").with_max_retries(1), ["a"])
        .task("c", TaskDefinition::new("c", "x").with_max_retries(1), ["a"])
        .build()
        .unwrap();

    let summary = orch.run_workflow(wf, Payload::new()).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert_eq!(orch.scheduler().tracked_count(), 0);
    assert_eq!(orch.stats()["scheduler.completed"], serde_json::json!(3));
}

#[tokio::test]
async fn workflow_stop_scenario_over_workers() {
    let (orch, tracker) = pool(&[("w1", 1)], Behaviour::FailFirst).await;
    let wf = WorkflowBuilder::new("chain")
        .task("s1", TaskDefinition::new("s1", "x").with_max_retries(1), NO_DEPS)
        .task("s2", TaskDefinition::new("s2", "x"), ["s1"])
        .task("s3", TaskDefinition::new("s3", "x"), ["s2"])
        .failure_strategy(FailureStrategy::Stop)
        .build()
        .unwrap();

    let summary = orch.run_workflow(wf, Payload::new()).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Failed);
    assert_eq!(summary.completed_steps, 1);
    assert_eq!(summary.failed_steps, 1);
    assert!(!tracker.started.lock().iter().any(|t| t == "s3"));
}

#[tokio::test]
async fn cancelling_a_run_cancels_its_tasks() {
    let (orch, tracker) = pool(&[("w1", 1)], Behaviour::Hang).await;
    let wf = WorkflowBuilder::new("stuck")
        .task("wait", TaskDefinition::new("wait", "x"), NO_DEPS)
        .build()
        .unwrap();
    let run_id = orch.submit_workflow(wf, Payload::new()).unwrap();

    while tracker.started.lock().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orch.cancel(run_id).await.unwrap();
    let summary = orch.wait_for_workflow(run_id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Failed);

    let exec = match orch.get_status(run_id).unwrap() {
        StatusReport::Workflow(exec) => exec,
        other => panic!("unexpected report {other:?}"),
    };
    assert_eq!(exec.status_of("wait"), Some(StepStatus::Cancelled));
    let task_id = exec.step_results["wait"].task_ids[0];
    assert_eq!(orch.scheduler().get_status(task_id).unwrap().status, TaskStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tracker.cancelled.lock().clone(), vec![task_id]);
}

// ---------------------------------------------------------------------------
// 5. Statistics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_expose_stable_keys() {
    let (orch, _) = pool(&[("w1", 1)], Behaviour::Complete(Duration::ZERO)).await;
    let stats = orch.stats();
    for key in [
        "scheduler.submitted",
        "scheduler.pending",
        "scheduler.eligible",
        "scheduler.running",
        "scheduler.completed",
        "scheduler.failed",
        "scheduler.cancelled",
        "scheduler.timed_out",
        "scheduler.retries",
        "scheduler.success_rate",
        "scheduler.avg_duration_ms",
        "scheduler.queue_depth",
        "scheduler.unknown_dependencies",
        "executor.workers",
        "executor.total_capacity",
        "executor.available_capacity",
        "executor.in_flight",
        "executor.assigned",
        "executor.completed",
        "executor.failed",
        "executor.duplicate_completions",
        "executor.workers_lost",
        "executor.no_capable_worker",
        "executor.no_capacity",
        "engine.runs_started",
        "engine.runs_active",
        "engine.runs_completed",
        "engine.runs_failed",
        "engine.steps_completed",
        "engine.steps_failed",
        "engine.steps_skipped",
        "engine.avg_run_ms",
        "engine.success_rate",
    ] {
        assert!(stats.contains_key(key), "missing {key}");
    }
    assert_eq!(stats["executor.workers"], serde_json::json!(1));
}
