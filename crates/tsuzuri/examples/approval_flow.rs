//! Expense approval with a human in the loop.
//!
//! Small expenses are approved automatically; large ones suspend the run until
//! a manager answers, then the run is resumed with the decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tsuzuri::prelude::*;
use tsuzuri::{ChannelSink, ExecutionError, TypedSchema, WorkflowEvent};

#[derive(Debug, Serialize, Deserialize)]
struct Expense {
    employee: String,
    amount: u64,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Decision {
    approved: bool,
    approver: String,
}

#[derive(Debug)]
struct RecordDecision {
    id: StepId,
}

#[async_trait]
impl Step for RecordDecision {
    fn id(&self) -> &StepId {
        &self.id
    }

    async fn handle(&self, input: Value, ctx: &RunContext) -> Result<StepOutcome, WorkflowError> {
        let expense: Expense = ctx
            .store()
            .get::<Value>("expense")
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| ExecutionError::StepFailed {
                step_id: self.id.clone(),
                source: "expense missing from store".into(),
            })?;

        println!(
            "Recording decision for {} ({}): {}",
            expense.employee, expense.amount, input
        );
        Ok(StepOutcome::done(json!({
            "employee": expense.employee,
            "amount": expense.amount,
            "decision": input,
        })))
    }
}

fn build_workflow() -> Result<Workflow, WorkflowError> {
    let (sink, mut events) = ChannelSink::channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let WorkflowEvent::StepCompleted { step_id, .. } = &event {
                println!("  event: step '{step_id}' completed");
            }
        }
    });

    Workflow::builder("expense_approval")
        .description("Approve expenses, asking a manager above the limit")
        .input_schema(TypedSchema::<Expense>::new())
        .event_sink(sink)
        .add_step(FnStep::new("submit", |input, ctx| async move {
            ctx.store().insert("expense", input.clone());
            Ok(StepOutcome::Done(input))
        }))
        .add_step(
            ConditionStep::new("route", |args| {
                if args.output["amount"].as_u64().unwrap_or(0) > 500 {
                    BranchTarget::to("manager_review")
                } else {
                    BranchTarget::to("auto_approve")
                }
            })
            .branches(["manager_review", "auto_approve"]),
        )
        .add_step(FnStep::map("auto_approve", |_| {
            Ok(json!({"approved": true, "approver": "policy"}))
        }))
        .add_step(
            ConditionStep::new("skip_review", |_| BranchTarget::to("record"))
                .branches(["record"]),
        )
        .add_step(
            FnStep::new("manager_review", |input, _ctx| async move {
                Ok(StepOutcome::suspend(json!({
                    "question": "Approve this expense?",
                    "expense": input,
                })))
            })
            .output_schema(TypedSchema::<Decision>::new()),
        )
        .add_step(RecordDecision {
            id: StepId::new("record"),
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let workflow = build_workflow()?;

    let small = json!({"employee": "kai", "amount": 120});
    let result = workflow.run(RunOptions::new(small)).await?;
    println!("Small expense: {:?}", result.into_output()?);

    let large = json!({"employee": "mio", "amount": 2400, "note": "conference"});
    let result = workflow.run(RunOptions::new(large)).await?;
    let Some(suspension) = result.suspension else {
        return Err("expected the large expense to wait for review".into());
    };
    println!(
        "Run {} is waiting at '{}': {}",
        result.run_id, suspension.step_id, suspension.payload
    );
    println!("Suspended runs: {:?}", workflow.suspended_runs());

    let decision = json!({"approved": true, "approver": "manager"});
    let resumed = workflow
        .resume_with_human_input(&result.run_id, "manager_review", decision)
        .await?;
    println!("Large expense: {:?}", resumed.into_output()?);

    Ok(())
}
