//! Per-execution state machine.

use crate::workflow::Definition;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, instrument, warn};
use tsuzuri_core::{
    merge_signals, AbortSignal, BranchArgs, BranchTarget, EventSink, Metadata, ResumeError,
    RunContext, RunStatus, Step, StepId, StepOutcome, Store, WorkflowError, WorkflowEvent,
};

/// Options for starting a run.
///
/// # Examples
///
/// ```
/// use tsuzuri::prelude::*;
/// use serde_json::json;
///
/// let signal = AbortSignal::new();
/// let options = RunOptions::new(json!({"order_id": 7})).signal(signal.clone());
/// # let _ = options;
/// ```
#[derive(Clone, Default)]
pub struct RunOptions {
    input: Value,
    signal: Option<AbortSignal>,
    sink: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("input", &self.input)
            .field("signal", &self.signal)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl RunOptions {
    /// Creates options with the given workflow input.
    pub fn new(input: impl Into<Value>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    /// Adds a caller-owned cancellation signal, merged with the run's own.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Sends this run's events to `sink` instead of the workflow's sink.
    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }
}

/// Where a suspended run is waiting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suspension {
    /// The step that suspended.
    pub step_id: StepId,
    /// What the step asked for.
    pub payload: Value,
}

/// Outcome of starting or resuming a run.
///
/// Failures are reported here with status [`RunStatus::Failed`]; only an
/// abort makes `start`/`resume` return `Err`.
#[derive(Debug)]
pub struct RunResult {
    /// The run's id.
    pub run_id: String,
    /// Completed, Failed or Suspended.
    pub status: RunStatus,
    /// The finalized, validated output when completed.
    pub result: Option<Value>,
    /// Metadata at the time the run stopped.
    pub metadata: Metadata,
    /// The error when failed.
    pub error: Option<WorkflowError>,
    /// The resume point when suspended.
    pub suspension: Option<Suspension>,
}

impl RunResult {
    /// Returns `true` if the run completed.
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Converts the result into the workflow output or the run's error.
    ///
    /// A suspended run yields [`WorkflowError::InvalidState`].
    pub fn into_output(self) -> Result<Value, WorkflowError> {
        match (self.status, self.error) {
            (_, Some(error)) => Err(error),
            (RunStatus::Completed, None) => Ok(self.result.unwrap_or(Value::Null)),
            (status, None) => Err(WorkflowError::InvalidState {
                run_id: self.run_id,
                status,
            }),
        }
    }
}

/// Suspended runs parked on a workflow, by run id.
#[derive(Default)]
pub(crate) struct RunRegistry {
    runs: Mutex<HashMap<String, Run>>,
}

impl RunRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, run: Run) {
        self.lock().insert(run.id().to_string(), run);
    }

    fn unpark(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub(crate) fn get(&self, run_id: &str) -> Option<Run> {
        self.lock().get(run_id).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct SuspendPoint {
    index: usize,
    step_id: StepId,
    input: Value,
    payload: Value,
}

enum Progress {
    Completed(Value),
    Suspended(SuspendPoint),
}

struct RunState {
    status: RunStatus,
    ctx: Option<RunContext>,
    suspended: Option<SuspendPoint>,
}

struct RunInner {
    id: String,
    definition: Arc<Definition>,
    registry: Weak<RunRegistry>,
    signal: AbortSignal,
    store: Store,
    state: Mutex<RunState>,
}

/// One execution of a workflow.
///
/// Created by [`Workflow::create_run`](crate::Workflow::create_run) with a
/// fresh store and a copy of the workflow's metadata. Cloning yields another
/// handle to the same run.
#[derive(Clone)]
pub struct Run {
    inner: Arc<RunInner>,
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.inner.id)
            .field("workflow_id", &self.inner.definition.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Run {
    pub(crate) fn new(
        id: String,
        definition: Arc<Definition>,
        registry: Weak<RunRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(RunInner {
                id,
                definition,
                registry,
                signal: AbortSignal::new(),
                store: Store::new(),
                state: Mutex::new(RunState {
                    status: RunStatus::Pending,
                    ctx: None,
                    suspended: None,
                }),
            }),
        }
    }

    /// Returns the run id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the current status.
    pub fn status(&self) -> RunStatus {
        self.state().status
    }

    /// Returns the current metadata.
    pub fn metadata(&self) -> Metadata {
        match &self.state().ctx {
            Some(ctx) => ctx.metadata(),
            None => self.inner.definition.metadata.clone(),
        }
    }

    /// Returns the run's store.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Returns where the run is waiting, if suspended.
    pub fn suspension(&self) -> Option<Suspension> {
        self.state().suspended.as_ref().map(|point| Suspension {
            step_id: point.step_id.clone(),
            payload: point.payload.clone(),
        })
    }

    /// Aborts the run.
    ///
    /// A running run stops at its next checkpoint. A pending or suspended
    /// run becomes Aborted immediately.
    pub fn cancel(&self, reason: &str) {
        self.inner.signal.abort(reason);

        let ctx = {
            let mut state = self.state();
            if !matches!(state.status, RunStatus::Pending | RunStatus::Suspended) {
                return;
            }
            state.status = RunStatus::Aborted;
            state.suspended = None;
            state.ctx.clone()
        };

        self.unpark();
        warn!(run_id = %self.inner.id, reason, "run cancelled");
        if let Some(ctx) = ctx {
            ctx.emit_event(WorkflowEvent::RunFinished {
                run_id: self.inner.id.clone(),
                status: RunStatus::Aborted,
            });
        }
    }

    /// Executes the run from its first step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Aborted`] if the run observed its signal or was
    /// cancelled before it started, and
    /// [`WorkflowError::InvalidState`] if the run was already started.
    /// Every other failure is reported in the returned [`RunResult`].
    #[instrument(
        name = "run_start",
        skip(self, options),
        fields(workflow_id = %self.inner.definition.id, run_id = %self.inner.id)
    )]
    pub async fn start(&self, options: RunOptions) -> Result<RunResult, WorkflowError> {
        let definition = &self.inner.definition;
        let signal = match options.signal {
            Some(caller) => merge_signals(&[self.inner.signal.clone(), caller]),
            None => self.inner.signal.clone(),
        };
        let ctx = RunContext::new(
            definition.id.as_str(),
            self.inner.id.as_str(),
            options.input.clone(),
            self.inner.store.clone(),
            definition.metadata.clone(),
            signal,
            options.sink.unwrap_or_else(|| definition.sink.clone()),
        );

        {
            let mut state = self.state();
            if state.status == RunStatus::Aborted {
                if let Some(reason) = self.inner.signal.reason() {
                    return Err(WorkflowError::aborted(reason));
                }
            }
            if state.status != RunStatus::Pending {
                return Err(WorkflowError::InvalidState {
                    run_id: self.inner.id.clone(),
                    status: state.status,
                });
            }
            state.status = RunStatus::Running;
            state.ctx = Some(ctx.clone());
        }

        info!("workflow_started");
        debug!(input = %options.input, "workflow input");
        ctx.emit_event(WorkflowEvent::RunStarted {
            workflow_id: definition.id.clone(),
            run_id: self.inner.id.clone(),
        });

        let progress = match definition.validate_input(options.input) {
            Ok(input) => self.drive(&ctx, 0, input).await,
            Err(e) => Err(e),
        };
        self.settle(&ctx, progress)
    }

    /// Re-enters a suspended run at the step it is waiting on.
    ///
    /// `data` is validated against that step's output schema and used as its
    /// output; branch resolution then applies as if the step had returned it.
    ///
    /// # Errors
    ///
    /// Returns [`ResumeError`] if the run is not suspended or waits on a
    /// different step; the run is left untouched. Returns
    /// [`WorkflowError::Aborted`] if the run observes its signal.
    #[instrument(
        name = "run_resume",
        skip(self, step_id, data),
        fields(workflow_id = %self.inner.definition.id, run_id = %self.inner.id)
    )]
    pub async fn resume(
        &self,
        step_id: impl Into<StepId>,
        data: Value,
    ) -> Result<RunResult, WorkflowError> {
        let requested = step_id.into();
        let (ctx, point) = {
            let mut state = self.state();
            let (Some(point), Some(ctx), RunStatus::Suspended) =
                (&state.suspended, &state.ctx, state.status)
            else {
                return Err(ResumeError::NotSuspended {
                    run_id: self.inner.id.clone(),
                    status: state.status,
                }
                .into());
            };
            if point.step_id != requested {
                return Err(ResumeError::StepMismatch {
                    run_id: self.inner.id.clone(),
                    expected: point.step_id.clone(),
                    requested,
                }
                .into());
            }
            let ctx = ctx.clone();
            state.status = RunStatus::Running;
            match state.suspended.take() {
                Some(point) => (ctx, point),
                None => {
                    return Err(WorkflowError::InvalidState {
                        run_id: self.inner.id.clone(),
                        status: state.status,
                    })
                }
            }
        };

        self.unpark();
        info!(step_id = %point.step_id, "workflow_resumed");

        let progress = self.resume_from(&ctx, point, data).await;
        self.settle(&ctx, progress)
    }

    async fn resume_from(
        &self,
        ctx: &RunContext,
        point: SuspendPoint,
        data: Value,
    ) -> Result<Progress, WorkflowError> {
        let step = self.step_at(point.index)?;
        let output = step.validate_output(data)?;
        self.step_completed(ctx, step, &output);

        match self.next_index(step, point.index, &point.input, &output, ctx)? {
            Some(next) => self.drive(ctx, next, output).await,
            None => Ok(Progress::Completed(output)),
        }
    }

    /// Runs steps from `index` until the sequence ends, a branch ends the
    /// run, or a step suspends.
    async fn drive(
        &self,
        ctx: &RunContext,
        mut index: usize,
        mut input: Value,
    ) -> Result<Progress, WorkflowError> {
        let run_id = &self.inner.id;

        while let Some(step) = self.inner.definition.steps.get(index) {
            ctx.signal().check()?;
            ctx.emit_event(WorkflowEvent::StepStarted {
                run_id: run_id.clone(),
                step_id: step.id().clone(),
            });

            let outcome = match step.execute(input.clone(), ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if !e.is_abort() {
                        warn!(step_id = %step.id(), error = %e, "Step '{}' failed", step.id());
                        ctx.emit_event(WorkflowEvent::StepFailed {
                            run_id: run_id.clone(),
                            step_id: step.id().clone(),
                            error: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            };

            match outcome {
                StepOutcome::Done(output) => {
                    self.step_completed(ctx, &**step, &output);
                    match self.next_index(&**step, index, &input, &output, ctx)? {
                        Some(next) => index = next,
                        None => return Ok(Progress::Completed(output)),
                    }
                    input = output;
                }
                StepOutcome::Suspend(payload) => {
                    info!(step_id = %step.id(), "Step '{}' suspended", step.id());
                    ctx.emit_event(WorkflowEvent::StepSuspended {
                        run_id: run_id.clone(),
                        step_id: step.id().clone(),
                        payload: payload.clone(),
                    });
                    return Ok(Progress::Suspended(SuspendPoint {
                        index,
                        step_id: step.id().clone(),
                        input,
                        payload,
                    }));
                }
            }
        }

        Ok(Progress::Completed(input))
    }

    fn step_completed(&self, ctx: &RunContext, step: &dyn Step, output: &Value) {
        info!(step_id = %step.id(), "Step '{}' completed successfully", step.id());
        ctx.emit_event(WorkflowEvent::StepCompleted {
            run_id: self.inner.id.clone(),
            step_id: step.id().clone(),
            output: output.clone(),
        });
    }

    /// Returns the index of the step to run after `step`, or `None` to end.
    fn next_index(
        &self,
        step: &dyn Step,
        index: usize,
        input: &Value,
        output: &Value,
        ctx: &RunContext,
    ) -> Result<Option<usize>, WorkflowError> {
        let metadata = ctx.metadata();
        let args = BranchArgs {
            input,
            output,
            metadata: &metadata,
            store: ctx.store(),
        };

        match step.resolve_branch(args) {
            None => Ok(Some(index + 1)),
            Some(BranchTarget::End) => Ok(None),
            Some(BranchTarget::Step(target)) => match self.inner.definition.position(&target) {
                Some(next) => Ok(Some(next)),
                None => Err(WorkflowError::BranchResolution {
                    step_id: step.id().clone(),
                    target,
                }),
            },
        }
    }

    fn step_at(&self, index: usize) -> Result<&dyn Step, WorkflowError> {
        self.inner
            .definition
            .steps
            .get(index)
            .map(|step| &**step)
            .ok_or_else(|| WorkflowError::InvalidState {
                run_id: self.inner.id.clone(),
                status: RunStatus::Running,
            })
    }

    /// Records how `drive` ended and builds the caller-facing result.
    fn settle(
        &self,
        ctx: &RunContext,
        progress: Result<Progress, WorkflowError>,
    ) -> Result<RunResult, WorkflowError> {
        let finished = match progress {
            Ok(Progress::Completed(raw)) => self.inner.definition.validate_output(raw),
            Ok(Progress::Suspended(point)) => match ctx.signal().check() {
                Ok(()) => return Ok(self.park(ctx, point)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (status, result, error) = match finished {
            Ok(output) => {
                info!("workflow_completed");
                (RunStatus::Completed, Some(output), None)
            }
            Err(e) if e.is_abort() => {
                warn!(error = %e, "workflow_aborted");
                self.finish(ctx, RunStatus::Aborted);
                return Err(e);
            }
            Err(e) => {
                error!(error = %e, "workflow_failed");
                (RunStatus::Failed, None, Some(e))
            }
        };

        self.finish(ctx, status);
        Ok(RunResult {
            run_id: self.inner.id.clone(),
            status,
            result,
            metadata: ctx.metadata(),
            error,
            suspension: None,
        })
    }

    fn park(&self, ctx: &RunContext, point: SuspendPoint) -> RunResult {
        let suspension = Suspension {
            step_id: point.step_id.clone(),
            payload: point.payload.clone(),
        };
        {
            let mut state = self.state();
            state.status = RunStatus::Suspended;
            state.suspended = Some(point);
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.park(self.clone());
        }

        info!(step_id = %suspension.step_id, "workflow_suspended");
        ctx.emit_event(WorkflowEvent::RunFinished {
            run_id: self.inner.id.clone(),
            status: RunStatus::Suspended,
        });

        RunResult {
            run_id: self.inner.id.clone(),
            status: RunStatus::Suspended,
            result: None,
            metadata: ctx.metadata(),
            error: None,
            suspension: Some(suspension),
        }
    }

    fn finish(&self, ctx: &RunContext, status: RunStatus) {
        self.state().status = status;
        ctx.emit_event(WorkflowEvent::RunFinished {
            run_id: self.inner.id.clone(),
            status,
        });
    }

    fn unpark(&self) {
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unpark(&self.inner.id);
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionStep;
    use crate::fn_step::FnStep;
    use crate::workflow::Workflow;
    use serde_json::json;
    use tsuzuri_core::{ErrorKind, ExecutionError};

    fn approval_workflow() -> Workflow {
        Workflow::builder("approval")
            .add_step(FnStep::map("draft", |v| Ok(json!({"draft": v}))))
            .add_step(FnStep::new("approve", |_input, _ctx| async {
                Ok(StepOutcome::suspend(json!({"question": "ship it?"})))
            }))
            .add_step(FnStep::map("publish", |v| Ok(json!({"published": v}))))
            .build()
            .expect("valid workflow")
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let workflow = Workflow::builder("once")
            .add_step(FnStep::map("noop", Ok))
            .build()
            .expect("valid workflow");
        let run = workflow.create_run(None);

        run.start(RunOptions::new(1)).await.expect("first start");
        let error = run.start(RunOptions::new(1)).await.expect_err("second start");
        assert_eq!(error.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_suspend_parks_and_resume_unparks() {
        let workflow = approval_workflow();
        let run = workflow.create_run(Some("r-1".to_string()));

        let suspended = run.start(RunOptions::new("text")).await.expect("runs");
        assert_eq!(suspended.status, RunStatus::Suspended);
        assert_eq!(
            suspended.suspension,
            Some(Suspension {
                step_id: StepId::new("approve"),
                payload: json!({"question": "ship it?"}),
            })
        );
        assert_eq!(workflow.suspended_runs(), vec!["r-1".to_string()]);

        let finished = run.resume("approve", json!("yes")).await.expect("resumes");
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.result, Some(json!({"published": "yes"})));
        assert!(workflow.suspended_runs().is_empty());
    }

    #[tokio::test]
    async fn test_resume_wrong_step_keeps_suspension() {
        let workflow = approval_workflow();
        let run = workflow.create_run(None);
        run.start(RunOptions::new("text")).await.expect("runs");

        let error = run.resume("publish", json!("yes")).await.expect_err("wrong step");
        assert!(matches!(
            error,
            WorkflowError::Resume(ResumeError::StepMismatch { .. })
        ));
        assert_eq!(run.status(), RunStatus::Suspended);
        assert_eq!(workflow.suspended_runs(), vec![run.id().to_string()]);
    }

    #[tokio::test]
    async fn test_resume_pending_run_fails() {
        let workflow = approval_workflow();
        let run = workflow.create_run(None);

        let error = run.resume("approve", json!(1)).await.expect_err("not started");
        assert!(matches!(
            error,
            WorkflowError::Resume(ResumeError::NotSuspended {
                status: RunStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_suspended_run() {
        let workflow = approval_workflow();
        let run = workflow.create_run(None);
        run.start(RunOptions::new("text")).await.expect("runs");

        run.cancel("no longer needed");

        assert_eq!(run.status(), RunStatus::Aborted);
        assert!(workflow.suspended_runs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_run_then_start() {
        let workflow = approval_workflow();
        let run = workflow.create_run(None);

        run.cancel("stop before start");
        let error = run.start(RunOptions::new("text")).await.expect_err("aborted");

        assert!(matches!(error, WorkflowError::Aborted { ref reason } if reason == "stop before start"));
        assert_eq!(run.status(), RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_during_suspending_step() {
        let workflow = Workflow::builder("late_cancel")
            .add_step(FnStep::new("ask", |_input, ctx| async move {
                ctx.signal().cancelled().await;
                Ok(StepOutcome::suspend(json!({"question": "still there?"})))
            }))
            .build()
            .expect("valid workflow");
        let run = workflow.create_run(None);
        let handle = run.clone();

        let (result, ()) = tokio::join!(run.start(RunOptions::new(1)), async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            handle.cancel("deadline");
        });

        let error = result.expect_err("aborted");
        assert!(matches!(error, WorkflowError::Aborted { ref reason } if reason == "deadline"));
        assert_eq!(run.status(), RunStatus::Aborted);
        assert!(run.suspension().is_none());
        assert!(workflow.suspended_runs().is_empty());
    }

    #[tokio::test]
    async fn test_branch_loop_back() {
        let workflow = Workflow::builder("retry_until_ready")
            .add_step(FnStep::new("poll", |_input, ctx| async move {
                let polls = ctx
                    .store()
                    .update("polls", |n: Option<&u32>| n.copied().unwrap_or(0) + 1);
                Ok(StepOutcome::done(polls))
            }))
            .add_step(
                ConditionStep::new("ready", |args| {
                    if args.output.as_u64().unwrap_or(0) < 3 {
                        BranchTarget::to("poll")
                    } else {
                        BranchTarget::End
                    }
                })
                .branches(["poll"])
                .may_end(),
            )
            .add_step(FnStep::map("unreachable", |_| Err("should not run".into())))
            .build()
            .expect("valid workflow");

        let result = workflow.run(RunOptions::default()).await.expect("runs");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.result, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_failed_result_into_output() {
        let workflow = Workflow::builder("fails")
            .add_step(FnStep::map("boom", |_| Err("boom".into())))
            .build()
            .expect("valid workflow");

        let result = workflow.run(RunOptions::new(1)).await.expect("not aborted");
        assert_eq!(result.status, RunStatus::Failed);

        let error = result.into_output().expect_err("failed");
        assert!(matches!(
            error,
            WorkflowError::Execution(ExecutionError::StepFailed { .. })
        ));
    }
}
