//! Bounded while-loop over a condition step and a body step.

use crate::for_each::CollectFn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use tsuzuri_core::{
    BoxError, ExecutionError, RunContext, Schema, Step, StepId, StepKind, StepOutcome,
    WorkflowError,
};

/// State handed to the condition and the body on every iteration.
///
/// Steps receive it as JSON and can read it back with
/// `serde_json::from_value::<WhileLoopState>(input)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhileLoopState {
    /// Number of completed body runs.
    pub iteration: u32,
    /// The input the while step received.
    pub initial_input: Value,
    /// Output of the latest body run, or the initial input before the first.
    pub last_output: Value,
}

impl WhileLoopState {
    fn new(input: Value) -> Self {
        Self {
            iteration: 0,
            initial_input: input.clone(),
            last_output: input,
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "iteration": self.iteration,
            "initial_input": self.initial_input,
            "last_output": self.last_output,
        })
    }
}

/// Repeats `body` while `condition` returns `true`.
///
/// The condition must produce a JSON boolean. The loop is bounded: if the
/// condition still holds after `max_iterations` body runs the step fails with
/// [`ExecutionError::IterationLimit`]. The step's output is the last body
/// output, or the result of `collect` over every body output when set.
#[derive(Clone)]
pub struct WhileStep {
    id: StepId,
    condition: Arc<dyn Step>,
    body: Arc<dyn Step>,
    max_iterations: u32,
    collect: Option<Arc<CollectFn>>,
    input_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
}

impl fmt::Debug for WhileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhileStep")
            .field("id", &self.id)
            .field("condition", &self.condition.id())
            .field("body", &self.body.id())
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

/// Builder for [`WhileStep`].
pub struct WhileStepBuilder {
    id: StepId,
    condition: Arc<dyn Step>,
    body: Arc<dyn Step>,
    max_iterations: Option<u32>,
    collect: Option<Arc<CollectFn>>,
    input_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
}

impl WhileStepBuilder {
    /// Sets the iteration bound. Required.
    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Sets a reducer over all body outputs, in iteration order.
    pub fn collect<F>(mut self, collect: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.collect = Some(Arc::new(collect));
        self
    }

    /// Sets the schema the input must satisfy.
    pub fn input_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.input_schema = Some(Arc::new(schema));
        self
    }

    /// Sets the schema the output must satisfy.
    pub fn output_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.output_schema = Some(Arc::new(schema));
        self
    }

    /// Builds the step.
    ///
    /// # Errors
    ///
    /// Returns an error if no iteration bound was set.
    pub fn build(self) -> Result<WhileStep, WorkflowError> {
        let max_iterations = self.max_iterations.ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "max_iterations must be specified for while step '{}'",
                self.id
            ))
        })?;

        Ok(WhileStep {
            id: self.id,
            condition: self.condition,
            body: self.body,
            max_iterations,
            collect: self.collect,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
        })
    }
}

impl WhileStep {
    /// Starts building a loop running `body` while `condition` holds.
    pub fn builder(
        id: impl Into<StepId>,
        condition: impl Step + 'static,
        body: impl Step + 'static,
    ) -> WhileStepBuilder {
        WhileStepBuilder {
            id: id.into(),
            condition: Arc::new(condition),
            body: Arc::new(body),
            max_iterations: None,
            collect: None,
            input_schema: None,
            output_schema: None,
        }
    }

    /// Returns the iteration bound.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    async fn should_continue(
        &self,
        state: &Value,
        ctx: &RunContext,
    ) -> Result<Result<bool, Value>, WorkflowError> {
        match self.condition.execute(state.clone(), ctx).await? {
            StepOutcome::Done(Value::Bool(proceed)) => Ok(Ok(proceed)),
            StepOutcome::Done(value) => Err(ExecutionError::NonBooleanCondition {
                step_id: self.id.clone(),
                value,
            }
            .into()),
            StepOutcome::Suspend(payload) => Ok(Err(payload)),
        }
    }
}

#[async_trait]
impl Step for WhileStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::While
    }

    fn input_schema(&self) -> Option<&dyn Schema> {
        self.input_schema.as_deref()
    }

    fn output_schema(&self) -> Option<&dyn Schema> {
        self.output_schema.as_deref()
    }

    fn children(&self) -> Vec<&dyn Step> {
        vec![&*self.condition, &*self.body]
    }

    async fn handle(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
        let mut state = WhileLoopState::new(input);
        let mut outputs = Vec::new();

        loop {
            ctx.signal().check()?;
            let state_value = state.to_value();

            let proceed = match self.should_continue(&state_value, ctx).await? {
                Ok(proceed) => proceed,
                Err(payload) => return Ok(StepOutcome::Suspend(payload)),
            };
            if !proceed {
                break;
            }
            if state.iteration >= self.max_iterations {
                return Err(ExecutionError::IterationLimit {
                    step_id: self.id.clone(),
                    max_iterations: self.max_iterations,
                }
                .into());
            }

            match self.body.execute(state_value, ctx).await? {
                StepOutcome::Done(output) => {
                    if self.collect.is_some() {
                        outputs.push(output.clone());
                    }
                    state.last_output = output;
                    state.iteration += 1;
                }
                StepOutcome::Suspend(payload) => return Ok(StepOutcome::Suspend(payload)),
            }
        }

        debug!(step_id = %self.id, iterations = state.iteration, "loop finished");
        match &self.collect {
            Some(collect) => collect(outputs)
                .map(StepOutcome::Done)
                .map_err(|source| {
                    ExecutionError::Collect {
                        step_id: self.id.clone(),
                        source,
                    }
                    .into()
                }),
            None => Ok(StepOutcome::Done(state.last_output)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fn_step::FnStep;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tsuzuri_core::{AbortSignal, ErrorKind};

    fn ctx() -> RunContext {
        RunContext::detached("test", json!(null))
    }

    fn iteration(state: &Value) -> u64 {
        state["iteration"].as_u64().unwrap_or_default()
    }

    fn below(limit: u64) -> FnStep {
        FnStep::map("below", move |state| Ok(json!(iteration(&state) < limit)))
    }

    fn next_iteration() -> FnStep {
        FnStep::map("next", |state| Ok(json!(iteration(&state) + 1)))
    }

    #[tokio::test]
    async fn test_runs_until_condition_fails() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let body = FnStep::map("next", move |state| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(iteration(&state) + 1))
        });
        let step = WhileStep::builder("loop", below(3), body)
            .max_iterations(10)
            .build()
            .expect("bounded");

        let outcome = step.execute(json!(3), &ctx()).await.expect("runs");

        assert_eq!(outcome, StepOutcome::done(3));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_iterations_returns_input() {
        let step = WhileStep::builder("loop", below(0), next_iteration())
            .max_iterations(5)
            .build()
            .expect("bounded");

        let outcome = step.execute(json!({"keep": true}), &ctx()).await.expect("runs");
        assert_eq!(outcome, StepOutcome::done(json!({"keep": true})));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let always = FnStep::map("always", |_| Ok(json!(true)));
        let step = WhileStep::builder("loop", always, next_iteration())
            .max_iterations(2)
            .build()
            .expect("bounded");

        let error = step.execute(json!(0), &ctx()).await.expect_err("too many");
        match error {
            WorkflowError::Execution(ExecutionError::IterationLimit {
                step_id,
                max_iterations,
            }) => {
                assert_eq!(step_id, "loop");
                assert_eq!(max_iterations, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_boolean_condition() {
        let yes = FnStep::map("yes", |_| Ok(json!("yes")));
        let step = WhileStep::builder("loop", yes, next_iteration())
            .max_iterations(2)
            .build()
            .expect("bounded");

        let error = step.execute(json!(0), &ctx()).await.expect_err("not a bool");
        assert!(matches!(
            error,
            WorkflowError::Execution(ExecutionError::NonBooleanCondition { ref value, .. })
                if *value == json!("yes")
        ));
    }

    #[test]
    fn test_build_requires_max_iterations() {
        let error = WhileStep::builder("loop", below(1), next_iteration())
            .build()
            .expect_err("unbounded");
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_collect_sees_every_output() {
        let step = WhileStep::builder("loop", below(4), next_iteration())
            .max_iterations(4)
            .collect(|outputs| Ok(Value::Array(outputs)))
            .build()
            .expect("bounded");

        let outcome = step.execute(json!(null), &ctx()).await.expect("runs");
        assert_eq!(outcome, StepOutcome::done(json!([1, 2, 3, 4])));
    }

    #[tokio::test]
    async fn test_body_reads_typed_state() {
        let body = FnStep::map("append", |state| {
            let state: WhileLoopState = serde_json::from_value(state)?;
            let text = state.last_output.as_str().unwrap_or_default();
            Ok(json!(format!("{text}!")))
        });
        let step = WhileStep::builder("loop", below(2), body)
            .max_iterations(2)
            .build()
            .expect("bounded");

        let outcome = step.execute(json!("hey"), &ctx()).await.expect("runs");
        assert_eq!(outcome, StepOutcome::done("hey!!"));
    }

    #[tokio::test]
    async fn test_abort_between_iterations() {
        let signal = AbortSignal::new();
        let ctx = ctx().with_signal(signal.clone());
        let body = FnStep::map("stop", move |state| {
            signal.abort("halt");
            Ok(json!(iteration(&state) + 1))
        });
        let step = WhileStep::builder("loop", below(10), body)
            .max_iterations(10)
            .build()
            .expect("bounded");

        let error = step.execute(json!(0), &ctx).await.expect_err("aborted");
        assert!(matches!(error, WorkflowError::Aborted { ref reason } if reason == "halt"));
    }
}
