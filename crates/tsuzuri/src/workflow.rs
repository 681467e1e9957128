//! Workflow definitions.

use crate::inspect::WorkflowGraph;
use crate::run::{Run, RunOptions, RunRegistry, RunResult};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tsuzuri_core::{
    parse_with_schema, BoxError, BranchTarget, EventSink, ExecutionError, Metadata, NoopSink,
    ResumeError, Schema, Step, StepId, ValidationTarget, WorkflowError,
};
use uuid::Uuid;

type FinalizeFn = dyn Fn(Value) -> Result<Value, BoxError> + Send + Sync;

/// The immutable part of a workflow, shared by all of its runs.
pub(crate) struct Definition {
    pub(crate) id: String,
    pub(crate) description: Option<String>,
    pub(crate) input_schema: Option<Arc<dyn Schema>>,
    pub(crate) output_schema: Option<Arc<dyn Schema>>,
    pub(crate) metadata: Metadata,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) steps: Vec<Arc<dyn Step>>,
    finalize: Option<Arc<FinalizeFn>>,
    positions: HashMap<StepId, usize>,
}

impl Definition {
    pub(crate) fn position(&self, id: &StepId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub(crate) fn validate_input(&self, input: Value) -> Result<Value, WorkflowError> {
        let target = ValidationTarget::WorkflowInput(self.id.clone());
        Ok(parse_with_schema(self.input_schema.as_deref(), input, &target)?)
    }

    /// Applies `finalize`, then the output schema.
    pub(crate) fn validate_output(&self, raw: Value) -> Result<Value, WorkflowError> {
        let output = match &self.finalize {
            Some(finalize) => finalize(raw).map_err(|source| ExecutionError::Finalize {
                workflow_id: self.id.clone(),
                source,
            })?,
            None => raw,
        };
        let target = ValidationTarget::WorkflowOutput(self.id.clone());
        Ok(parse_with_schema(self.output_schema.as_deref(), output, &target)?)
    }
}

/// An ordered sequence of steps with input and output validation.
///
/// A workflow is built once and run many times; every run gets its own store
/// and a copy of the workflow's metadata. Cloning is cheap and clones share
/// the registry of suspended runs.
///
/// # Examples
///
/// ```
/// use tsuzuri::prelude::*;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), WorkflowError> {
/// let workflow = Workflow::builder("greeting")
///     .add_step(FnStep::map("greet", |name| {
///         Ok(json!(format!("hello, {}", name.as_str().unwrap_or("world"))))
///     }))
///     .build()?;
///
/// let output = workflow.run(RunOptions::new("tsuzuri")).await?.into_output()?;
/// assert_eq!(output, json!("hello, tsuzuri"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Workflow {
    definition: Arc<Definition>,
    registry: Arc<RunRegistry>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.definition.id)
            .field("steps", &self.step_ids().collect::<Vec<_>>())
            .finish()
    }
}

impl Workflow {
    /// Creates a new workflow builder.
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(id)
    }

    /// Returns the workflow id.
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Returns the description, if any.
    pub fn description(&self) -> Option<&str> {
        self.definition.description.as_deref()
    }

    /// Returns the top-level step ids in execution order.
    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.definition.steps.iter().map(|step| step.id())
    }

    /// Returns `true` if a top-level step with the given id exists.
    pub fn has_step(&self, id: &str) -> bool {
        self.definition.positions.contains_key(id)
    }

    /// Returns the number of top-level steps.
    pub fn step_count(&self) -> usize {
        self.definition.steps.len()
    }

    /// Validates a value against the workflow's input schema.
    pub fn validate_input(&self, input: Value) -> Result<Value, WorkflowError> {
        self.definition.validate_input(input)
    }

    /// Applies `finalize` to a raw step output, then the output schema.
    pub fn validate_output(&self, raw: Value) -> Result<Value, WorkflowError> {
        self.definition.validate_output(raw)
    }

    /// Creates a pending run. Without an id a random one is generated.
    pub fn create_run(&self, run_id: Option<String>) -> Run {
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Run::new(
            run_id,
            Arc::clone(&self.definition),
            Arc::downgrade(&self.registry),
        )
    }

    /// Creates a run and starts it.
    ///
    /// See [`Run::start`] for how outcomes are reported.
    pub async fn run(&self, options: RunOptions) -> Result<RunResult, WorkflowError> {
        self.create_run(None).start(options).await
    }

    /// Resumes a suspended run of this workflow by id.
    ///
    /// # Errors
    ///
    /// Returns [`ResumeError::UnknownRun`] if no run with that id is parked,
    /// otherwise the errors of [`Run::resume`].
    pub async fn resume_with_human_input(
        &self,
        run_id: &str,
        step_id: impl Into<StepId>,
        data: Value,
    ) -> Result<RunResult, WorkflowError> {
        let run = self
            .registry
            .get(run_id)
            .ok_or_else(|| ResumeError::UnknownRun {
                run_id: run_id.to_string(),
            })?;
        run.resume(step_id, data).await
    }

    /// Returns the ids of suspended runs, sorted.
    pub fn suspended_runs(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Returns a suspended run by id.
    pub fn get_run(&self, run_id: &str) -> Option<Run> {
        self.registry.get(run_id)
    }

    /// Describes the step graph for external tooling.
    pub fn inspect(&self) -> WorkflowGraph {
        WorkflowGraph::from_definition(&self.definition)
    }
}

/// Builder for constructing [`Workflow`] instances.
pub struct WorkflowBuilder {
    id: String,
    description: Option<String>,
    input_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
    metadata: Metadata,
    finalize: Option<Arc<FinalizeFn>>,
    sink: Arc<dyn EventSink>,
    steps: Vec<Arc<dyn Step>>,
}

impl fmt::Debug for WorkflowBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field("id", &self.id)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl WorkflowBuilder {
    /// Creates a new empty workflow builder.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            input_schema: None,
            output_schema: None,
            metadata: Metadata::new(),
            finalize: None,
            sink: Arc::new(NoopSink),
            steps: Vec::new(),
        }
    }

    /// Sets a human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the schema the workflow input must satisfy.
    pub fn input_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.input_schema = Some(Arc::new(schema));
        self
    }

    /// Sets the schema the finalized output must satisfy.
    pub fn output_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.output_schema = Some(Arc::new(schema));
        self
    }

    /// Sets the metadata every run starts with.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the function mapping the last step's output to the workflow
    /// output. It runs before the output schema.
    pub fn finalize<F>(mut self, finalize: F) -> Self
    where
        F: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.finalize = Some(Arc::new(finalize));
        self
    }

    /// Sets the default event sink for runs of this workflow.
    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Appends a step.
    pub fn add_step<S: Step + 'static>(self, step: S) -> Self {
        self.add_shared_step(Arc::new(step))
    }

    /// Appends a step shared with other workflows.
    pub fn add_shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Builds the workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no steps, if two steps (nested ones
    /// included) share an id, or if a step declares a branch to a step that
    /// does not exist.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            check_unique_ids(&**step, &mut seen)?;
        }

        let positions: HashMap<StepId, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.id().clone(), index))
            .collect();

        for step in &self.steps {
            for target in step.declared_branches() {
                if let BranchTarget::Step(target) = target {
                    if !positions.contains_key(&target) {
                        return Err(WorkflowError::Configuration(format!(
                            "step '{}' declares a branch to unknown step '{}'",
                            step.id(),
                            target
                        )));
                    }
                }
            }
        }

        Ok(Workflow {
            definition: Arc::new(Definition {
                id: self.id,
                description: self.description,
                input_schema: self.input_schema,
                output_schema: self.output_schema,
                metadata: self.metadata,
                sink: self.sink,
                steps: self.steps,
                finalize: self.finalize,
                positions,
            }),
            registry: Arc::new(RunRegistry::default()),
        })
    }
}

fn check_unique_ids<'a>(
    step: &'a dyn Step,
    seen: &mut HashSet<&'a StepId>,
) -> Result<(), WorkflowError> {
    if !seen.insert(step.id()) {
        return Err(WorkflowError::Configuration(format!(
            "duplicate step id '{}'",
            step.id()
        )));
    }
    for child in step.children() {
        check_unique_ids(child, seen)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionStep;
    use crate::fn_step::FnStep;
    use crate::for_each::ForEachStep;
    use serde_json::json;
    use tsuzuri_core::{ErrorKind, SafeSchema, SchemaError, Validation};

    fn identity(id: &str) -> FnStep {
        FnStep::map(id, Ok)
    }

    #[test]
    fn test_builder_requires_steps() {
        let result = Workflow::builder("empty").build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_builder_rejects_duplicate_ids() {
        let error = Workflow::builder("dup")
            .add_step(identity("a"))
            .add_step(identity("a"))
            .build()
            .expect_err("duplicate");
        assert_eq!(
            error.to_string(),
            "Invalid workflow configuration: duplicate step id 'a'"
        );
    }

    #[test]
    fn test_builder_rejects_duplicate_nested_ids() {
        let error = Workflow::builder("dup")
            .add_step(identity("item"))
            .add_step(ForEachStep::new("each", identity("item")))
            .build()
            .expect_err("nested duplicate");
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_builder_rejects_unknown_branch() {
        let error = Workflow::builder("branches")
            .add_step(ConditionStep::new("route", |_| BranchTarget::End).branches(["nowhere"]))
            .build()
            .expect_err("unknown target");
        assert!(error.to_string().contains("unknown step 'nowhere'"));
    }

    #[test]
    fn test_workflow_accessors() {
        let workflow = Workflow::builder("wf")
            .description("two steps")
            .add_step(identity("first"))
            .add_step(identity("second"))
            .build()
            .expect("valid workflow");

        assert_eq!(workflow.id(), "wf");
        assert_eq!(workflow.description(), Some("two steps"));
        assert_eq!(workflow.step_count(), 2);
        assert!(workflow.has_step("second"));
        assert!(!workflow.has_step("third"));
        assert_eq!(
            workflow.step_ids().map(StepId::as_str).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
    }

    #[test]
    fn test_validate_output_runs_finalize_first() {
        let workflow = Workflow::builder("wf")
            .add_step(identity("only"))
            .finalize(|raw| Ok(json!({"total": raw})))
            .output_schema(SafeSchema::new("object", |v| {
                if v.get("total").is_some() {
                    Validation::Valid
                } else {
                    Validation::invalid("missing total")
                }
            }))
            .build()
            .expect("valid workflow");

        assert_eq!(
            workflow.validate_output(json!(5)).expect("finalized"),
            json!({"total": 5})
        );
    }

    #[test]
    fn test_validate_input() {
        let workflow = Workflow::builder("wf")
            .input_schema(SafeSchema::new("string", |v| {
                if v.is_string() {
                    Validation::Valid
                } else {
                    Validation::invalid("expected a string")
                }
            }))
            .add_step(identity("only"))
            .build()
            .expect("valid workflow");

        assert!(workflow.validate_input(json!("ok")).is_ok());
        let error = workflow.validate_input(json!(1)).expect_err("rejected");
        assert!(matches!(
            error,
            WorkflowError::Schema(SchemaError::Mismatch {
                target: ValidationTarget::WorkflowInput(_),
                ..
            })
        ));
    }

    #[test]
    fn test_create_run_ids() {
        let workflow = Workflow::builder("wf")
            .add_step(identity("only"))
            .build()
            .expect("valid workflow");

        assert_eq!(workflow.create_run(Some("fixed".into())).id(), "fixed");
        assert_ne!(workflow.create_run(None).id(), workflow.create_run(None).id());
    }
}
