//! Dependency-aware task scheduling, worker placement and workflow
//! execution for Conductor.
//!
//! Tasks are queued by the [`TaskScheduler`], placed on capable workers by
//! the [`TaskExecutor`] and composed into multi-step runs by the
//! [`WorkflowEngine`]. The [`Orchestrator`] ties the three together behind
//! a single submission and worker-callback interface.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade for submitting work and receiving worker results.
//! - [`TaskScheduler`] — Priority queue of pending tasks with dependency tracking.
//! - [`TaskExecutor`] — Worker registry with capability matching and load balancing.
//! - [`WorkflowEngine`] — Runs workflow step graphs with bounded parallelism.
//! - [`WorkflowBuilder`] — Fluent construction and validation of workflows.
//! - [`DependencyResolver`] — Incremental dependency counter shared by tasks and steps.

/// Workflow builder and structural validation.
pub mod builder;
/// Declarative conditions evaluated against a run context.
pub mod condition;
/// Orchestrator configuration.
pub mod config;
/// Transport seam between the executor and workers.
pub mod dispatch;
/// Workflow execution engine.
pub mod engine;
/// Worker registry and task placement.
pub mod executor;
/// Flat statistics helpers.
pub mod monitor;
/// Top-level orchestrator facade.
pub mod orchestrator;
/// Incremental dependency resolution.
pub mod resolver;
/// Task scheduler.
pub mod scheduler;
/// Priority task queue with lifecycle bookkeeping.
pub mod task_queue;
/// Workflow definitions and run records.
pub mod workflow;

pub use builder::{ValidationIssue, WorkflowBuilder, WorkflowValidator, NO_DEPS};
pub use condition::{Condition, ConditionError};
pub use config::{EngineConfig, ExecutorConfig, OrchestratorConfig, RetryPolicy, SchedulerConfig};
pub use dispatch::{Assignment, AttemptRef, ChannelDispatcher, DispatchOutcome, Dispatcher, WorkerMessage};
pub use engine::{EngineStats, StepInvocation, StepOutcome, StepRunner, WorkflowEngine};
pub use executor::{ExecutorStats, Placement, TaskExecutor, WorkerInfo, WorkerSpec};
pub use monitor::StatsMap;
pub use orchestrator::{Orchestrator, StatusReport};
pub use resolver::{DependencyResolver, ResolveError};
pub use scheduler::{SchedulerStats, TaskScheduler};
pub use task_queue::{CancelOutcome, TaskQueue, TimeoutEvent};
pub use workflow::{
    FailureStrategy, RunError, RunId, RunOutcome, StepId, StepKind, StepResult, StepStatus,
    WorkflowConfig, WorkflowDefinition, WorkflowExecution, WorkflowStatus, WorkflowStep,
    WorkflowSummary,
};
