use crate::config::OrchestratorConfig;
use crate::dispatch::{AttemptRef, Dispatcher};
use crate::engine::{StepInvocation, StepOutcome, StepRunner, WorkflowEngine};
use crate::executor::{TaskExecutor, WorkerInfo, WorkerSpec};
use crate::monitor::StatsMap;
use crate::scheduler::TaskScheduler;
use crate::task_queue::TimeoutEvent;
use crate::workflow::{RunId, WorkflowDefinition, WorkflowExecution, WorkflowSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    ConductorError, ConductorResult, HandlerRegistry, LifecycleContext, LifecycleHandler,
    LifecyclePhase, Payload, ResourceSample, TaskDefinition, TaskExecution, TaskId, TaskStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current state of a task or a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusReport {
    Task(TaskExecution),
    Workflow(WorkflowExecution),
}

/// Scheduler and executor plus the bookkeeping that joins them.
///
/// Lock order is `waiters` before the scheduler queue.
struct TaskHub {
    scheduler: TaskScheduler,
    executor: TaskExecutor,
    waiters: Mutex<HashMap<TaskId, Vec<oneshot::Sender<TaskExecution>>>>,
    /// First time each pending task found no capable worker.
    unplaced: Mutex<HashMap<TaskId, DateTime<Utc>>>,
    placement_timeout: chrono::Duration,
}

impl TaskHub {
    /// Hand every eligible task to a worker with room for it.
    async fn pump(&self) -> usize {
        let mut deferred = Vec::new();
        let mut dispatched = 0;

        while let Some(task) = self.scheduler.next_eligible() {
            let attempt = self
                .scheduler
                .get_status(task.id)
                .map_or(1, |exec| exec.attempt);
            match self.executor.reserve(&task, attempt) {
                Ok(placement) => {
                    self.unplaced.lock().remove(&task.id);
                    if let Err(e) = self.scheduler.start(task.id, &placement.worker_id) {
                        debug!(task_id = %task.id, error = %e, "Task changed state before start");
                        self.executor.release(task.id);
                        deferred.push(task.id);
                        continue;
                    }
                    match self.executor.dispatch(&task, &placement).await {
                        Ok(()) => dispatched += 1,
                        Err(_) => {
                            if let Err(e) = self.scheduler.requeue(task.id) {
                                debug!(task_id = %task.id, error = %e, "Rejected task could not be requeued");
                            }
                            deferred.push(task.id);
                        }
                    }
                }
                Err(e @ ConductorError::NoCapableWorker { .. }) => {
                    let now = Utc::now();
                    let first_seen = *self.unplaced.lock().entry(task.id).or_insert(now);
                    if now - first_seen >= self.placement_timeout {
                        self.unplaced.lock().remove(&task.id);
                        if let Err(err) = self.scheduler.abandon(task.id, &e.to_string()) {
                            debug!(task_id = %task.id, error = %err, "Unplaceable task could not be abandoned");
                        }
                    } else {
                        debug!(task_id = %task.id, error = %e, "No capable worker yet");
                    }
                    deferred.push(task.id);
                }
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Task deferred");
                    deferred.push(task.id);
                }
            }
        }

        for task_id in deferred {
            self.scheduler.release(task_id);
        }
        self.notify_finished();
        dispatched
    }

    /// Wake everyone waiting on a task that reached a terminal state.
    fn notify_finished(&self) {
        let mut waiters = self.waiters.lock();
        for task_id in self.scheduler.take_finished() {
            self.unplaced.lock().remove(&task_id);
            let Some(senders) = waiters.remove(&task_id) else {
                continue;
            };
            if let Some(exec) = self.scheduler.get_status(task_id) {
                for sender in senders {
                    let _ = sender.send(exec.clone());
                }
            }
        }
    }

    async fn wait_for_task(&self, task_id: TaskId) -> ConductorResult<TaskExecution> {
        let receiver = {
            let mut waiters = self.waiters.lock();
            let exec = self
                .scheduler
                .get_status(task_id)
                .ok_or_else(|| ConductorError::not_found("task", task_id))?;
            if exec.status.is_terminal() {
                return Ok(exec);
            }
            let (sender, receiver) = oneshot::channel();
            waiters.entry(task_id).or_default().push(sender);
            receiver
        };
        receiver
            .await
            .map_err(|_| ConductorError::not_found("task", task_id))
    }

    async fn cancel_task(&self, task_id: TaskId) -> ConductorResult<()> {
        let outcome = self.scheduler.cancel(task_id)?;
        if outcome.was_running {
            self.executor.cancel_execution(task_id).await;
        }
        self.notify_finished();
        Ok(())
    }

    async fn check_timeouts(&self) -> Vec<TimeoutEvent> {
        let events = self.scheduler.check_timeouts();
        for event in &events {
            if event.worker_id.is_some() {
                self.executor.cancel_execution(event.task_id).await;
            }
        }
        if !events.is_empty() {
            self.notify_finished();
        }
        events
    }
}

/// Runs workflow task steps through the scheduler and the worker pool.
struct SchedulerStepRunner {
    hub: Arc<TaskHub>,
}

#[async_trait]
impl StepRunner for SchedulerStepRunner {
    async fn run_task(&self, invocation: StepInvocation) -> StepOutcome {
        let task_id = invocation.task.id;
        if let Err(e) = self.hub.scheduler.submit(invocation.task) {
            return StepOutcome::Failed(e.to_string());
        }
        self.hub.pump().await;

        let outcome = tokio::select! {
            finished = self.hub.wait_for_task(task_id) => match finished {
                Ok(exec) => match exec.status {
                    TaskStatus::Completed => StepOutcome::Completed(exec.output),
                    TaskStatus::Cancelled => StepOutcome::Cancelled,
                    status => StepOutcome::Failed(
                        exec.error.unwrap_or_else(|| format!("task ended as {status}")),
                    ),
                },
                Err(e) => StepOutcome::Failed(e.to_string()),
            },
            _ = invocation.cancel.cancelled() => {
                if let Err(e) = self.hub.cancel_task(task_id).await {
                    debug!(task_id = %task_id, error = %e, "Step task already finished");
                }
                StepOutcome::Cancelled
            }
        };
        // step results live on in the run record
        self.hub.scheduler.retire(task_id);
        outcome
    }
}

/// Entry point tying the scheduler, the executor and the workflow engine
/// together.
///
/// Callers submit tasks and workflows; workers register, receive
/// assignments through the [`Dispatcher`] and report back through
/// [`complete_execution`](Self::complete_execution) and
/// [`fail_execution`](Self::fail_execution).
pub struct Orchestrator {
    hub: Arc<TaskHub>,
    engine: Arc<WorkflowEngine>,
    config: OrchestratorConfig,
    handlers: Mutex<HashMap<LifecyclePhase, HandlerRegistry>>,
    root: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator that reaches workers through `dispatcher`.
    pub fn new(config: OrchestratorConfig, dispatcher: Arc<dyn Dispatcher>) -> ConductorResult<Self> {
        config.validate()?;
        let placement_timeout = chrono::Duration::milliseconds(
            i64::try_from(config.executor.placement_timeout_ms).unwrap_or(i64::MAX),
        );
        let hub = Arc::new(TaskHub {
            scheduler: TaskScheduler::new(config.scheduler.clone()),
            executor: TaskExecutor::new(dispatcher, config.executor.clone()),
            waiters: Mutex::new(HashMap::new()),
            unplaced: Mutex::new(HashMap::new()),
            placement_timeout,
        });
        let root = CancellationToken::new();
        let runner = Arc::new(SchedulerStepRunner {
            hub: Arc::clone(&hub),
        });
        let engine = Arc::new(
            WorkflowEngine::new(runner, config.engine.clone()).with_cancellation(root.child_token()),
        );

        Ok(Self {
            hub,
            engine,
            config,
            handlers: Mutex::new(HashMap::new()),
            root,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get a reference to the task scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.hub.scheduler
    }

    /// Get a reference to the task executor.
    pub fn executor(&self) -> &TaskExecutor {
        &self.hub.executor
    }

    /// Get a reference to the workflow engine.
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    // --- Submission ---

    /// Queue a standalone task. It is assigned by the next pump.
    pub fn submit_task(&self, task: TaskDefinition) -> ConductorResult<TaskId> {
        self.hub.scheduler.submit(task)
    }

    /// Start a workflow run in the background.
    pub fn submit_workflow(
        &self,
        definition: WorkflowDefinition,
        inputs: Payload,
    ) -> ConductorResult<RunId> {
        self.engine.submit(definition, inputs)
    }

    /// Run a workflow to completion.
    pub async fn run_workflow(
        &self,
        definition: WorkflowDefinition,
        inputs: Payload,
    ) -> ConductorResult<WorkflowSummary> {
        self.engine.run(definition, inputs).await
    }

    pub async fn wait_for_workflow(&self, run_id: RunId) -> ConductorResult<WorkflowSummary> {
        self.engine.wait(run_id).await
    }

    /// Wait until a task reaches a terminal state.
    pub async fn wait_for_task(&self, task_id: TaskId) -> ConductorResult<TaskExecution> {
        self.hub.wait_for_task(task_id).await
    }

    /// Look up a task or a workflow run by id.
    pub fn get_status(&self, id: Uuid) -> Option<StatusReport> {
        if let Some(exec) = self.hub.scheduler.get_status(id) {
            return Some(StatusReport::Task(exec));
        }
        self.engine.get_run(id).map(StatusReport::Workflow)
    }

    /// Cancel a task or a workflow run.
    pub async fn cancel(&self, id: Uuid) -> ConductorResult<()> {
        if self.engine.contains(id) {
            return self.engine.cancel_run(id);
        }
        self.hub.cancel_task(id).await
    }

    // --- Workers ---

    pub async fn register_worker(&self, spec: WorkerSpec) -> ConductorResult<()> {
        self.hub.executor.register(spec)?;
        self.hub.pump().await;
        Ok(())
    }

    /// Remove a worker. Its in-flight tasks count as failed attempts.
    pub async fn unregister_worker(&self, worker_id: &str) -> ConductorResult<Vec<TaskId>> {
        let lost = self.hub.executor.unregister_worker(worker_id)?;
        for task_id in &lost {
            if let Err(e) = self.hub.scheduler.fail(*task_id, "worker lost") {
                warn!(task_id = %task_id, error = %e, "Lost task could not be failed");
            }
        }
        self.hub.notify_finished();
        self.hub.pump().await;
        Ok(lost)
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.hub.executor.workers()
    }

    // --- Worker callbacks ---

    /// Record a successful result. Returns `false` for a result whose
    /// attempt no longer holds the assignment (duplicate, late after cancel
    /// or timeout, or from an earlier attempt).
    pub async fn complete_execution(&self, attempt: &AttemptRef, output: Payload) -> ConductorResult<bool> {
        if self.hub.executor.complete_execution(attempt).is_none() {
            return Ok(false);
        }
        self.hub.scheduler.complete(attempt.task_id, output)?;
        self.hub.notify_finished();
        self.hub.pump().await;
        Ok(true)
    }

    /// Record a failed attempt; the scheduler decides whether to retry.
    pub async fn fail_execution(
        &self,
        attempt: &AttemptRef,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> ConductorResult<bool> {
        if self.hub.executor.fail_execution(attempt, message).is_none() {
            return Ok(false);
        }
        self.hub
            .scheduler
            .fail_with_details(attempt.task_id, message, details)?;
        self.hub.notify_finished();
        self.hub.pump().await;
        Ok(true)
    }

    pub fn report_progress(&self, task_id: TaskId, percent: u8, message: &str) -> ConductorResult<()> {
        self.hub.scheduler.record_progress(task_id, percent, message)
    }

    pub fn record_resource_sample(&self, task_id: TaskId, sample: ResourceSample) -> ConductorResult<()> {
        self.hub.scheduler.record_resource_sample(task_id, sample)
    }

    // --- Loops ---

    /// Assign eligible tasks now. Returns how many were dispatched.
    pub async fn pump(&self) -> usize {
        self.hub.pump().await
    }

    /// Enforce task timeouts and deadlines now.
    pub async fn check_timeouts(&self) -> Vec<TimeoutEvent> {
        let events = self.hub.check_timeouts().await;
        if !events.is_empty() {
            self.hub.pump().await;
        }
        events
    }

    /// Register a lifecycle handler for `phase`.
    pub fn add_handler(&self, phase: LifecyclePhase, priority: i32, handler: Arc<dyn LifecycleHandler>) {
        self.handlers
            .lock()
            .entry(phase)
            .or_default()
            .register(priority, handler);
    }

    /// Run the startup handlers, then spawn the pump and timeout loops.
    /// A second call while started does nothing.
    pub fn start(&self) -> ConductorResult<()> {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            warn!("Orchestrator already started");
            return Ok(());
        }

        let ctx = self.lifecycle_context(LifecyclePhase::Startup);
        if let Some(registry) = self.handlers.lock().get(&LifecyclePhase::Startup) {
            registry.invoke_all(&ctx)?;
        }

        let hub = Arc::clone(&self.hub);
        let token = self.root.clone();
        let every = Duration::from_millis(self.config.pump_interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.pump().await;
                    }
                }
            }
            debug!("Pump loop stopped");
        }));

        let hub = Arc::clone(&self.hub);
        let token = self.root.clone();
        let every = Duration::from_millis(self.config.scheduler.timeout_check_interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !hub.check_timeouts().await.is_empty() {
                            hub.pump().await;
                        }
                    }
                }
            }
            debug!("Timeout loop stopped");
        }));

        info!(
            pump_interval_ms = self.config.pump_interval_ms,
            timeout_check_interval_ms = self.config.scheduler.timeout_check_interval_ms,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop the background loops, cancel running workflows and run the
    /// shutdown handlers. Returns the number of handlers that failed.
    pub async fn shutdown(&self) -> usize {
        self.root.cancel();
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }

        let ctx = self.lifecycle_context(LifecyclePhase::Shutdown);
        let failures = self
            .handlers
            .lock()
            .get(&LifecyclePhase::Shutdown)
            .map_or(0, |registry| registry.invoke_all_lenient(&ctx));
        info!(handler_failures = failures, "Orchestrator shut down");
        failures
    }

    /// Merged flat statistics of scheduler, executor and engine.
    pub fn stats(&self) -> StatsMap {
        let mut map = self.hub.scheduler.snapshot().to_map();
        map.extend(self.hub.executor.snapshot().to_map());
        map.extend(self.engine.snapshot().to_map());
        map
    }

    fn lifecycle_context(&self, phase: LifecyclePhase) -> LifecycleContext {
        LifecycleContext {
            phase,
            at: Utc::now(),
            stats: self.stats(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
