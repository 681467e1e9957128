//! Core traits and types for the tsuzuri workflow engine.
//!
//! Library authors depend on this crate to implement custom steps; the
//! `tsuzuri` crate builds workflows and runs them.
//!
//! # Core Types
//!
//! - [`Step`] - The core trait for workflow steps
//! - [`StepOutcome`] - Result of step execution: a value or a suspension
//! - [`RunContext`] - Per-run store, metadata, signal and event sink
//! - [`WorkflowError`] - Error taxonomy for building and running workflows
//!
//! # Utilities
//!
//! - [`Schema`] and [`parse_with_schema`] - Validation without a fixed library
//! - [`AbortSignal`] and [`merge_signals`] - Cooperative cancellation

mod context;
mod error;
mod event;
mod schema;
mod signal;
mod step;

pub use context::{Metadata, RunContext, RunStatus, Store, StoreKey};
pub use error::{
    BoxError, ErrorKind, ExecutionError, ResumeError, SchemaError, ValidationTarget,
    WorkflowError,
};
pub use event::{ChannelSink, EventSink, NoopSink, WorkflowEvent};
pub use schema::{
    parse_with_schema, FallibleSchema, SafeSchema, Schema, SchemaViolation, TypedSchema,
    Validation,
};
pub use signal::{merge_signals, AbortSignal};
pub use step::{
    wrap_handler_error, BranchArgs, BranchTarget, Step, StepId, StepKind, StepOutcome,
};
