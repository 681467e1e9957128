//! Bounded-concurrency fan-out of a step over a collection.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use tsuzuri_core::{
    BoxError, ExecutionError, RunContext, Schema, Step, StepId, StepKind, StepOutcome,
    WorkflowError,
};

type ItemsFn = dyn Fn(&Value) -> Result<Vec<Value>, BoxError> + Send + Sync;
pub(crate) type CollectFn = dyn Fn(Vec<Value>) -> Result<Value, BoxError> + Send + Sync;

/// Runs a nested step once per item, with at most `concurrency` items in
/// flight.
///
/// Items are produced from the step's input when the step executes; by
/// default the input must be a JSON array. Outputs are gathered in input
/// order no matter which item finishes first, then passed to `collect` (by
/// default they are returned as an array).
///
/// If any item fails, the whole step fails with
/// [`ExecutionError::ItemFailed`] naming the item's index; items still in
/// flight are dropped and no aggregate is produced. The run's signal is
/// checked before each item is claimed.
///
/// # Examples
///
/// ```
/// use tsuzuri::prelude::*;
/// use serde_json::json;
///
/// let double = FnStep::map("double", |v| Ok(json!(v.as_i64().unwrap_or(0) * 2)));
/// let fan_out = ForEachStep::new("double_all", double).concurrency(4);
/// # let _ = fan_out;
/// ```
#[derive(Clone)]
pub struct ForEachStep {
    id: StepId,
    item_step: Arc<dyn Step>,
    concurrency: usize,
    items: Option<Arc<ItemsFn>>,
    collect: Option<Arc<CollectFn>>,
    input_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
}

impl fmt::Debug for ForEachStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForEachStep")
            .field("id", &self.id)
            .field("item_step", &self.item_step.id())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Work shared by the workers of one execution.
struct Batch<'a> {
    items: &'a [Value],
    next: AtomicUsize,
    results: Vec<OnceLock<Value>>,
    suspended: OnceLock<Value>,
}

impl ForEachStep {
    /// Creates a for-each step running `item_step` on each item, one at a time.
    pub fn new(id: impl Into<StepId>, item_step: impl Step + 'static) -> Self {
        Self::from_arc(id, Arc::new(item_step))
    }

    /// Creates a for-each step from a shared item step.
    pub fn from_arc(id: impl Into<StepId>, item_step: Arc<dyn Step>) -> Self {
        Self {
            id: id.into(),
            item_step,
            concurrency: 1,
            items: None,
            collect: None,
            input_schema: None,
            output_schema: None,
        }
    }

    /// Sets how many items may run at once. Values below 1 mean 1.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets how items are produced from the step input.
    pub fn items<F>(mut self, items: F) -> Self
    where
        F: Fn(&Value) -> Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        self.items = Some(Arc::new(items));
        self
    }

    /// Sets the reducer applied to the ordered item outputs.
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

    fn produce_items(&self, input: Value) -> Result<Vec<Value>, WorkflowError> {
        let items = match (&self.items, input) {
            (Some(items), input) => items(&input),
            (None, Value::Array(items)) => Ok(items),
            (None, other) => Err(format!("expected an array, got {other}").into()),
        };
        items.map_err(|source| {
            ExecutionError::InvalidItems {
                step_id: self.id.clone(),
                source,
            }
            .into()
        })
    }

    async fn run_worker(&self, batch: &Batch<'_>, ctx: &RunContext) -> Result<(), WorkflowError> {
        loop {
            ctx.signal().check()?;
            if batch.suspended.get().is_some() {
                return Ok(());
            }

            let index = batch.next.fetch_add(1, Ordering::SeqCst);
            let Some(item) = batch.items.get(index) else {
                return Ok(());
            };

            match self.item_step.execute(item.clone(), ctx).await {
                Ok(StepOutcome::Done(output)) => {
                    if let Some(slot) = batch.results.get(index) {
                        let _ = slot.set(output);
                    }
                }
                Ok(StepOutcome::Suspend(payload)) => {
                    debug!(step_id = %self.id, index, "item suspended");
                    let _ = batch.suspended.set(payload);
                    return Ok(());
                }
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    return Err(ExecutionError::ItemFailed {
                        step_id: self.id.clone(),
                        index,
                        source: Box::new(e),
                    }
                    .into())
                }
            }
        }
    }

    fn finish(&self, outputs: Vec<Value>) -> Result<StepOutcome, WorkflowError> {
        let value = match &self.collect {
            Some(collect) => collect(outputs).map_err(|source| ExecutionError::Collect {
                step_id: self.id.clone(),
                source,
            })?,
            None => Value::Array(outputs),
        };
        Ok(StepOutcome::Done(value))
    }
}

#[async_trait]
impl Step for ForEachStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::ForEach
    }

    fn input_schema(&self) -> Option<&dyn Schema> {
        self.input_schema.as_deref()
    }

    fn output_schema(&self) -> Option<&dyn Schema> {
        self.output_schema.as_deref()
    }

    fn children(&self) -> Vec<&dyn Step> {
        vec![&*self.item_step]
    }

    async fn handle(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
        let items = self.produce_items(input)?;
        let total = items.len();
        let workers = self.concurrency.min(total);
        debug!(step_id = %self.id, total, workers, "fanning out");

        let batch = Batch {
            items: &items,
            next: AtomicUsize::new(0),
            results: (0..total).map(|_| OnceLock::new()).collect(),
            suspended: OnceLock::new(),
        };

        // All workers are polled on the current task; the first error drops
        // the rest.
        try_join_all((0..workers).map(|_| self.run_worker(&batch, ctx))).await?;

        let Batch {
            results, suspended, ..
        } = batch;
        if let Some(payload) = suspended.into_inner() {
            return Ok(StepOutcome::Suspend(payload));
        }

        let outputs = results
            .into_iter()
            .map(|slot| slot.into_inner().unwrap_or_default())
            .collect();
        self.finish(outputs)
    }
}
