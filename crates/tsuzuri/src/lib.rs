//! A lightweight workflow engine for Rust.
//!
//! Steps are composed into a [`Workflow`]; each execution is a [`Run`] that
//! threads every step's output into the next step's input. Besides plain
//! steps there are three composite kinds:
//!
//! - [`ConditionStep`] picks the next step (or ends the run)
//! - [`ForEachStep`] fans a step out over a collection with bounded concurrency
//! - [`WhileStep`] repeats a body while a condition holds, up to a bound
//!
//! A step may suspend the run to wait for external input; the run is parked
//! on its workflow until [`Workflow::resume_with_human_input`] is called.
//!
//! # Example
//!
//! ```
//! use tsuzuri::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), WorkflowError> {
//!     let workflow = Workflow::builder("pricing")
//!         .add_step(FnStep::new("quote", |input, ctx| async move {
//!             ctx.store().insert("currency", "EUR".to_string());
//!             let qty = input["qty"].as_u64().ok_or("missing qty")?;
//!             Ok(StepOutcome::done(json!({"total": qty * 12})))
//!         }))
//!         .add_step(
//!             ConditionStep::new("large_order", |args| {
//!                 if args.output["total"].as_u64().unwrap_or(0) > 100 {
//!                     BranchTarget::to("discount")
//!                 } else {
//!                     BranchTarget::End
//!                 }
//!             })
//!             .branches(["discount"])
//!             .may_end(),
//!         )
//!         .add_step(FnStep::map("discount", |quote| {
//!             let total = quote["total"].as_u64().unwrap_or(0);
//!             Ok(json!({"total": total * 9 / 10}))
//!         }))
//!         .build()?;
//!
//!     let result = workflow.run(RunOptions::new(json!({"qty": 10}))).await?;
//!     assert_eq!(result.into_output()?, json!({"total": 108}));
//!     Ok(())
//! }
//! ```

mod condition;
mod fn_step;
mod for_each;
mod inspect;
mod run;
mod while_loop;
mod workflow;

// Re-export core types
pub use tsuzuri_core::*;

pub use condition::ConditionStep;
pub use fn_step::FnStep;
pub use for_each::ForEachStep;
pub use inspect::{Edge, EdgeKind, StepNode, WorkflowGraph};
pub use run::{Run, RunOptions, RunResult, Suspension};
pub use while_loop::{WhileLoopState, WhileStep, WhileStepBuilder};
pub use workflow::{Workflow, WorkflowBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        AbortSignal, BranchTarget, ConditionStep, ErrorKind, FnStep, ForEachStep, Metadata,
        RunContext, RunOptions, RunResult, RunStatus, Step, StepId, StepOutcome, Store,
        WhileStep, Workflow, WorkflowBuilder, WorkflowError,
    };
}
