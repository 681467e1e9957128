//! Workflow error types.

use crate::step::StepId;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Boxed error returned by user handlers, validators and reducers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a schema was applied to when validation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationTarget {
    /// Input of a workflow.
    WorkflowInput(String),
    /// Output of a workflow, after `finalize`.
    WorkflowOutput(String),
    /// Input of a step.
    StepInput(StepId),
    /// Output of a step, or resume data substituted for it.
    StepOutput(StepId),
}

impl fmt::Display for ValidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationTarget::WorkflowInput(id) => write!(f, "input of workflow '{}'", id),
            ValidationTarget::WorkflowOutput(id) => write!(f, "output of workflow '{}'", id),
            ValidationTarget::StepInput(id) => write!(f, "input of step '{}'", id),
            ValidationTarget::StepOutput(id) => write!(f, "output of step '{}'", id),
        }
    }
}

/// A value failed schema validation.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The value does not have the shape the schema describes.
    #[error("{target} does not match schema: {}", .issues.join("; "))]
    Mismatch {
        /// What was being validated.
        target: ValidationTarget,
        /// Human-readable validation issues.
        issues: Vec<String>,
    },

    /// The validator itself failed while checking the value.
    #[error("schema validator failed on {target}: {source}")]
    Validator {
        /// What was being validated.
        target: ValidationTarget,
        /// The validator's own error.
        #[source]
        source: BoxError,
    },
}

impl SchemaError {
    /// Returns what was being validated.
    pub fn target(&self) -> &ValidationTarget {
        match self {
            SchemaError::Mismatch { target, .. } | SchemaError::Validator { target, .. } => target,
        }
    }
}

/// A step handler failed or an engine invariant was violated while running.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// A step handler returned an error.
    #[error("step '{step_id}' failed: {source}")]
    StepFailed {
        /// The step whose handler failed.
        step_id: StepId,
        /// The handler's error.
        #[source]
        source: BoxError,
    },

    /// One item of a for-each step failed.
    #[error("step '{step_id}' failed on item {index}: {source}")]
    ItemFailed {
        /// The for-each step.
        step_id: StepId,
        /// Index of the failing item in input order.
        index: usize,
        /// The item step's error.
        #[source]
        source: Box<WorkflowError>,
    },

    /// The items of a for-each step could not be produced.
    #[error("step '{step_id}' could not produce items: {source}")]
    InvalidItems {
        /// The for-each step.
        step_id: StepId,
        /// Why the items could not be produced.
        #[source]
        source: BoxError,
    },

    /// A loop condition returned something other than a boolean.
    #[error("condition of step '{step_id}' returned a non-boolean value: {value}")]
    NonBooleanCondition {
        /// The while step.
        step_id: StepId,
        /// The value the condition returned.
        value: Value,
    },

    /// A loop wanted to run more iterations than allowed.
    #[error("step '{step_id}' exceeded its limit of {max_iterations} iterations")]
    IterationLimit {
        /// The while step.
        step_id: StepId,
        /// The configured bound.
        max_iterations: u32,
    },

    /// A `collect` reducer failed.
    #[error("collect of step '{step_id}' failed: {source}")]
    Collect {
        /// The composite step owning the reducer.
        step_id: StepId,
        /// The reducer's error.
        #[source]
        source: BoxError,
    },

    /// The workflow `finalize` function failed.
    #[error("finalize of workflow '{workflow_id}' failed: {source}")]
    Finalize {
        /// The workflow.
        workflow_id: String,
        /// The finalizer's error.
        #[source]
        source: BoxError,
    },
}

impl ExecutionError {
    /// Returns the step the error is attributed to, if any.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            ExecutionError::StepFailed { step_id, .. }
            | ExecutionError::ItemFailed { step_id, .. }
            | ExecutionError::InvalidItems { step_id, .. }
            | ExecutionError::NonBooleanCondition { step_id, .. }
            | ExecutionError::IterationLimit { step_id, .. }
            | ExecutionError::Collect { step_id, .. } => Some(step_id),
            ExecutionError::Finalize { .. } => None,
        }
    }
}

/// A resume request did not match a run suspended at that step.
#[derive(Error, Debug)]
pub enum ResumeError {
    /// No suspended run with this id is parked on the workflow.
    #[error("no suspended run '{run_id}'")]
    UnknownRun {
        /// The requested run.
        run_id: String,
    },

    /// The run exists but is not suspended.
    #[error("run '{run_id}' is not suspended (status: {status})")]
    NotSuspended {
        /// The requested run.
        run_id: String,
        /// The run's current status.
        status: crate::context::RunStatus,
    },

    /// The run is suspended at a different step.
    #[error("run '{run_id}' is suspended at step '{expected}', not '{requested}'")]
    StepMismatch {
        /// The requested run.
        run_id: String,
        /// The step the run is waiting on.
        expected: StepId,
        /// The step named by the caller.
        requested: StepId,
    },
}

/// Broad classification of a [`WorkflowError`].
///
/// Callers branch on this instead of matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input or output validation failed.
    Schema,
    /// A handler failed or an engine invariant was violated.
    Execution,
    /// Cooperative cancellation was observed.
    Abort,
    /// A condition step named an unknown step.
    BranchResolution,
    /// A resume request was invalid.
    Resume,
    /// The workflow definition is invalid.
    Configuration,
    /// An operation was called in the wrong run state.
    InvalidState,
}

/// Errors that can occur while building or running a workflow.
///
/// This enum is marked `#[non_exhaustive]`; include a wildcard arm or match
/// on [`WorkflowError::kind`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// Input or output validation failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A handler failed or an engine invariant was violated.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The run observed its cancellation signal.
    #[error("run aborted: {reason}")]
    Aborted {
        /// The reason given to the first signal that fired.
        reason: String,
    },

    /// A condition step resolved to a step that does not exist.
    #[error("step '{step_id}' resolved to unknown step '{target}'")]
    BranchResolution {
        /// The condition step.
        step_id: StepId,
        /// The unknown target.
        target: StepId,
    },

    /// A resume request did not match a suspended run.
    #[error(transparent)]
    Resume(#[from] ResumeError),

    /// The workflow configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),

    /// A run operation was called in a state that does not allow it.
    #[error("run '{run_id}' cannot do this while {status}")]
    InvalidState {
        /// The run.
        run_id: String,
        /// Its current status.
        status: crate::context::RunStatus,
    },
}

impl WorkflowError {
    /// Creates an abort error with the given reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        WorkflowError::Aborted {
            reason: reason.into(),
        }
    }

    /// Returns the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Schema(_) => ErrorKind::Schema,
            WorkflowError::Execution(_) => ErrorKind::Execution,
            WorkflowError::Aborted { .. } => ErrorKind::Abort,
            WorkflowError::BranchResolution { .. } => ErrorKind::BranchResolution,
            WorkflowError::Resume(_) => ErrorKind::Resume,
            WorkflowError::Configuration(_) => ErrorKind::Configuration,
            WorkflowError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Returns `true` if this is a cancellation, not a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, WorkflowError::Aborted { .. })
    }
}
