//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the error taxonomy, the task data model and the lifecycle
//! handler interface.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`TaskDefinition`] — Immutable description of one unit of work.
//! - [`TaskExecution`] — Mutable record of the attempts to run a task.
//! - [`HandlerRegistry`] — Ordered startup/shutdown hooks.

/// Serde helpers for millisecond durations.
pub mod duration_ms;
/// Error taxonomy.
pub mod error;
/// Startup and shutdown handler interface.
pub mod handler;
/// Task definitions and execution records.
pub mod task;

pub use error::{ConductorError, ConductorResult, ErrorKind};
pub use handler::{HandlerRegistry, LifecycleContext, LifecycleHandler, LifecyclePhase};
pub use task::{
    FailedAttempt, Payload, Priority, ProgressCheckpoint, ResourceSample, TaskDefinition,
    TaskExecution, TaskId, TaskStatus,
};
