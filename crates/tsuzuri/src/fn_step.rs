//! Closure-backed steps.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tsuzuri_core::{
    wrap_handler_error, BoxError, RunContext, Schema, Step, StepId, StepOutcome, WorkflowError,
};

pub(crate) type Handler =
    dyn Fn(Value, RunContext) -> BoxFuture<'static, Result<StepOutcome, BoxError>> + Send + Sync;

pub(crate) fn boxed_handler<F, Fut>(handler: F) -> Arc<Handler>
where
    F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, BoxError>> + Send + 'static,
{
    Arc::new(move |input, ctx| handler(input, ctx).boxed())
}

/// Runs a boxed handler, attributing failures to `step_id`.
pub(crate) async fn call_handler(
    handler: &Handler,
    step_id: &StepId,
    input: Value,
    ctx: &RunContext,
) -> Result<StepOutcome, WorkflowError> {
    handler(input, ctx.clone())
        .await
        .map_err(|e| wrap_handler_error(step_id, e))
}

/// A step whose handler is an async closure.
///
/// The handler receives the validated input and a clone of the run context.
///
/// # Examples
///
/// ```
/// use tsuzuri::prelude::*;
/// use serde_json::json;
///
/// let fetch = FnStep::new("fetch", |input, ctx| async move {
///     ctx.store().insert("fetched", true);
///     Ok(StepOutcome::done(json!({"id": input["id"].clone(), "status": "ok"})))
/// });
///
/// let double = FnStep::map("double", |input| {
///     let n = input.as_i64().ok_or("expected an integer")?;
///     Ok(json!(n * 2))
/// });
/// # let _ = (fetch, double);
/// ```
#[derive(Clone)]
pub struct FnStep {
    id: StepId,
    input_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
    handler: Arc<Handler>,
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("id", &self.id)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .finish()
    }
}

impl FnStep {
    /// Creates a step from an async handler.
    pub fn new<F, Fut>(id: impl Into<StepId>, handler: F) -> Self
    where
        F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, BoxError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            input_schema: None,
            output_schema: None,
            handler: boxed_handler(handler),
        }
    }

    /// Creates a step from a synchronous value transformation.
    pub fn map<F>(id: impl Into<StepId>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(id, move |input, _ctx| {
            let f = Arc::clone(&f);
            async move { f(input).map(StepOutcome::Done) }
        })
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
}

#[async_trait]
impl Step for FnStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn input_schema(&self) -> Option<&dyn Schema> {
        self.input_schema.as_deref()
    }

    fn output_schema(&self) -> Option<&dyn Schema> {
        self.output_schema.as_deref()
    }

    async fn handle(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
        call_handler(&*self.handler, &self.id, input, ctx).await
    }
}
