//! Step trait and related types.

use crate::context::{Metadata, RunContext, Store};
use crate::error::{ExecutionError, ValidationTarget, WorkflowError};
use crate::schema::{parse_with_schema, Schema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug};
use tracing::debug;

/// Type-safe step identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Creates a new StepId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the step id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Output from a step execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step produced a value, which becomes the next step's input.
    Done(Value),
    /// The step is waiting for external input.
    ///
    /// The payload describes what the step is waiting for and is handed to
    /// whoever resumes the run.
    Suspend(Value),
}

impl StepOutcome {
    /// Creates a Done outcome.
    pub fn done(value: impl Into<Value>) -> Self {
        Self::Done(value.into())
    }

    /// Creates a Suspend outcome.
    pub fn suspend(payload: impl Into<Value>) -> Self {
        Self::Suspend(payload.into())
    }

    /// Returns the produced value, if the step completed.
    pub fn into_done(self) -> Option<Value> {
        match self {
            Self::Done(value) => Some(value),
            Self::Suspend(_) => None,
        }
    }
}

/// Where control goes after a condition step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchTarget {
    /// Jump to the step with this id.
    Step(StepId),
    /// End the run now with the current output.
    End,
}

impl BranchTarget {
    /// Creates a jump to the given step.
    pub fn to(id: impl Into<StepId>) -> Self {
        Self::Step(id.into())
    }
}

/// Everything a branch resolver may look at.
#[derive(Debug, Clone, Copy)]
pub struct BranchArgs<'a> {
    /// The input the condition step received.
    pub input: &'a Value,
    /// The output the condition step produced.
    pub output: &'a Value,
    /// The run's metadata at resolution time.
    pub metadata: &'a Metadata,
    /// The run's store.
    pub store: &'a Store,
}

/// Kind of a step, as shown by the inspector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A plain handler step.
    Task,
    /// A step that also decides which step runs next.
    Condition,
    /// A step fanning a nested step out over a collection.
    ForEach,
    /// A step looping over a condition and a body.
    While,
}

/// A workflow step that can be executed asynchronously.
///
/// Implementors provide [`Step::handle`]; the engine calls [`Step::execute`],
/// which wraps the handler with input and output validation. Composite steps
/// are ordinary implementors that drive nested steps through their
/// `execute`.
///
/// # Examples
///
/// ```
/// use tsuzuri_core::{RunContext, Step, StepId, StepOutcome, WorkflowError};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// #[derive(Debug)]
/// struct Greet {
///     id: StepId,
/// }
///
/// #[async_trait]
/// impl Step for Greet {
///     fn id(&self) -> &StepId {
///         &self.id
///     }
///
///     async fn handle(&self, input: Value, _ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
///         let name = input.as_str().unwrap_or("world");
///         Ok(StepOutcome::done(json!(format!("hello, {name}"))))
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the step id.
    fn id(&self) -> &StepId;

    /// Runs the step logic on an already validated input.
    async fn handle(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError>;

    /// Schema the input must satisfy.
    fn input_schema(&self) -> Option<&dyn Schema> {
        None
    }

    /// Schema the output must satisfy.
    fn output_schema(&self) -> Option<&dyn Schema> {
        None
    }

    /// Decides which step runs next. `None` continues with the next step in
    /// sequence.
    fn resolve_branch(&self, _args: BranchArgs<'_>) -> Option<BranchTarget> {
        None
    }

    /// Branch targets this step may resolve to, for inspection and
    /// build-time checks.
    fn declared_branches(&self) -> Vec<BranchTarget> {
        Vec::new()
    }

    /// Steps driven internally by this step.
    fn children(&self) -> Vec<&dyn Step> {
        Vec::new()
    }

    /// Returns the kind of step.
    fn kind(&self) -> StepKind {
        StepKind::Task
    }

    /// Validates the input, runs the handler and validates the output.
    ///
    /// A suspension payload is returned as-is; it is not the step's output.
    async fn execute(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
        let input = parse_with_schema(
            self.input_schema(),
            input,
            &ValidationTarget::StepInput(self.id().clone()),
        )?;

        debug!(step_id = %self.id(), "executing step");
        match self.handle(input, ctx).await? {
            StepOutcome::Done(output) => {
                let output = self.validate_output(output)?;
                Ok(StepOutcome::Done(output))
            }
            StepOutcome::Suspend(payload) => Ok(StepOutcome::Suspend(payload)),
        }
    }

    /// Validates a value against the output schema.
    ///
    /// Used for handler results and for data substituted on resume.
    fn validate_output(&self, output: Value) -> Result<Value, WorkflowError> {
        let output = parse_with_schema(
            self.output_schema(),
            output,
            &ValidationTarget::StepOutput(self.id().clone()),
        )?;
        Ok(output)
    }
}

/// Converts a handler failure into the error the engine reports.
///
/// An abort raised inside a handler is passed through unchanged so it stays
/// distinguishable from a failure; anything else is attributed to `step_id`.
pub fn wrap_handler_error(step_id: &StepId, error: crate::error::BoxError) -> WorkflowError {
    match error.downcast::<WorkflowError>() {
        Ok(inner) if inner.is_abort() => *inner,
        Ok(inner) => ExecutionError::StepFailed {
            step_id: step_id.clone(),
            source: inner,
        }
        .into(),
        Err(other) => ExecutionError::StepFailed {
            step_id: step_id.clone(),
            source: other,
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SchemaError};
    use crate::schema::{SafeSchema, Validation};
    use serde_json::json;

    #[derive(Debug)]
    struct Double {
        id: StepId,
        schema: SafeSchema,
    }

    #[async_trait]
    impl Step for Double {
        fn id(&self) -> &StepId {
            &self.id
        }

        fn input_schema(&self) -> Option<&dyn Schema> {
            Some(&self.schema)
        }

        async fn handle(
            &self,
            input: Value,
            _ctx: &RunContext,
        ) -> Result<StepOutcome, WorkflowError> {
            let n = input.as_i64().unwrap_or_default();
            Ok(StepOutcome::done(n * 2))
        }
    }

    fn double() -> Double {
        Double {
            id: StepId::new("double"),
            schema: SafeSchema::new("integer", |value| {
                if value.is_i64() {
                    Validation::Valid
                } else {
                    Validation::invalid("expected an integer")
                }
            }),
        }
    }

    #[test]
    fn test_step_id() {
        let id = StepId::new("test");
        assert_eq!(id.as_str(), "test");

        let id: StepId = "test".into();
        assert_eq!(id, "test");
    }

    #[test]
    fn test_step_outcome() {
        assert_eq!(StepOutcome::done(1), StepOutcome::Done(json!(1)));
        assert_eq!(StepOutcome::suspend("ask").into_done(), None);
    }

    #[tokio::test]
    async fn test_execute_validates_input() {
        let ctx = RunContext::detached("wf", json!(null));
        let step = double();

        let outcome = step.execute(json!(21), &ctx).await.expect("valid input");
        assert_eq!(outcome, StepOutcome::done(42));

        let error = step
            .execute(json!("21"), &ctx)
            .await
            .expect_err("string input is rejected");
        assert_eq!(error.kind(), ErrorKind::Schema);
        assert!(matches!(
            error,
            WorkflowError::Schema(SchemaError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_wrap_handler_error_passes_abort_through() {
        let step_id = StepId::new("s");

        let abort: crate::error::BoxError = Box::new(WorkflowError::aborted("stop"));
        assert!(wrap_handler_error(&step_id, abort).is_abort());

        let failure: crate::error::BoxError = "boom".into();
        let wrapped = wrap_handler_error(&step_id, failure);
        assert!(matches!(
            wrapped,
            WorkflowError::Execution(ExecutionError::StepFailed { ref step_id, .. }) if step_id == "s"
        ));
    }
}
