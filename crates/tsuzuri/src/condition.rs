//! Condition steps: produce an output and pick the next step.

use crate::fn_step::{boxed_handler, call_handler, Handler};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tsuzuri_core::{
    BoxError, BranchArgs, BranchTarget, RunContext, Schema, Step, StepId, StepKind, StepOutcome,
    WorkflowError,
};

type Resolver = dyn Fn(BranchArgs<'_>) -> BranchTarget + Send + Sync;

/// A step that decides which step runs after it.
///
/// Without a handler the step passes its input through unchanged, so it only
/// routes. The resolver sees the input, the output, the metadata and the
/// store, and returns the id of the next step or [`BranchTarget::End`].
///
/// # Examples
///
/// ```
/// use tsuzuri::prelude::*;
///
/// let route = ConditionStep::new("route", |args| {
///     if args.output["amount"].as_f64().unwrap_or(0.0) > 1000.0 {
///         BranchTarget::to("manual_review")
///     } else {
///         BranchTarget::to("auto_approve")
///     }
/// })
/// .branches(["manual_review", "auto_approve"]);
/// # let _ = route;
/// ```
#[derive(Clone)]
pub struct ConditionStep {
    id: StepId,
    input_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
    handler: Option<Arc<Handler>>,
    resolver: Arc<Resolver>,
    branches: Vec<BranchTarget>,
}

impl fmt::Debug for ConditionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionStep")
            .field("id", &self.id)
            .field("has_handler", &self.handler.is_some())
            .field("branches", &self.branches)
            .finish()
    }
}

impl ConditionStep {
    /// Creates a pass-through condition step with the given resolver.
    pub fn new<R>(id: impl Into<StepId>, resolver: R) -> Self
    where
        R: Fn(BranchArgs<'_>) -> BranchTarget + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            input_schema: None,
            output_schema: None,
            handler: None,
            resolver: Arc::new(resolver),
            branches: Vec::new(),
        }
    }

    /// Sets a handler producing the step's output.
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, BoxError>> + Send + 'static,
    {
        self.handler = Some(boxed_handler(handler));
        self
    }

    /// Declares the steps the resolver may pick.
    ///
    /// Declared targets are checked when the workflow is built and shown by
    /// the inspector. The resolver is not restricted to them.
    pub fn branches<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.branches
            .extend(targets.into_iter().map(|t| BranchTarget::Step(t.into())));
        self
    }

    /// Declares that the resolver may end the run.
    pub fn may_end(mut self) -> Self {
        self.branches.push(BranchTarget::End);
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
}

#[async_trait]
impl Step for ConditionStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn input_schema(&self) -> Option<&dyn Schema> {
        self.input_schema.as_deref()
    }

    fn output_schema(&self) -> Option<&dyn Schema> {
        self.output_schema.as_deref()
    }

    async fn handle(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
        match &self.handler {
            Some(handler) => call_handler(&**handler, &self.id, input, ctx).await,
            None => Ok(StepOutcome::Done(input)),
        }
    }

    fn resolve_branch(&self, args: BranchArgs<'_>) -> Option<BranchTarget> {
        Some((self.resolver)(args))
    }

    fn declared_branches(&self) -> Vec<BranchTarget> {
        self.branches.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tsuzuri_core::{Metadata, Store};

    #[tokio::test]
    async fn test_default_handler_passes_input_through() {
        let step = ConditionStep::new("route", |_| BranchTarget::End);
        let ctx = RunContext::detached("test", json!(null));

        let outcome = step.execute(json!({"a": 1}), &ctx).await.expect("runs");
        assert_eq!(outcome, StepOutcome::done(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_handler_output_feeds_resolver() {
        let step = ConditionStep::new("route", |args| {
            if args.output.as_bool() == Some(true) {
                BranchTarget::to("yes")
            } else {
                BranchTarget::to("no")
            }
        })
        .handler(|input, _ctx| async move {
            Ok(StepOutcome::done(input.as_i64().unwrap_or(0) > 10))
        });
        let ctx = RunContext::detached("test", json!(null));

        let input = json!(42);
        let output = step
            .execute(input.clone(), &ctx)
            .await
            .expect("runs")
            .into_done()
            .expect("done");
        let metadata = Metadata::new();
        let store = Store::new();
        let target = step.resolve_branch(BranchArgs {
            input: &input,
            output: &output,
            metadata: &metadata,
            store: &store,
        });

        assert_eq!(target, Some(BranchTarget::to("yes")));
    }

    #[test]
    fn test_declared_branches() {
        let step = ConditionStep::new("route", |_| BranchTarget::End)
            .branches(["a", "b"])
            .may_end();

        assert_eq!(
            step.declared_branches(),
            vec![BranchTarget::to("a"), BranchTarget::to("b"), BranchTarget::End]
        );
        assert_eq!(step.kind(), StepKind::Condition);
    }
}
