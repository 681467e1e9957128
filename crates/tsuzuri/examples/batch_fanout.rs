//! Batch processing with bounded fan-out, a polling loop and a deadline.
//!
//! Thumbnails for a batch of images are rendered four at a time, then the
//! upload job is polled until it reports completion. The whole run shares a
//! deadline signal.

use serde_json::{json, Value};
use std::time::Duration;
use tsuzuri::prelude::*;

fn render_thumbnail() -> FnStep {
    FnStep::new("render", |image, ctx| async move {
        let name = image.as_str().unwrap_or("unknown").to_string();
        let delay = 20 + (name.len() as u64 % 4) * 10;
        tokio::time::sleep(Duration::from_millis(delay)).await;

        ctx.store()
            .update("rendered", |n: Option<&u32>| n.copied().unwrap_or(0) + 1);
        Ok(StepOutcome::done(json!({
            "source": name,
            "thumbnail": format!("thumbs/{name}"),
        })))
    })
}

fn upload_job() -> Result<WhileStep, WorkflowError> {
    let pending = FnStep::map("pending", |state| {
        Ok(json!(state["last_output"]["status"] != json!("done")))
    });
    let poll = FnStep::new("poll", |state, ctx| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let attempt = state["iteration"].as_u64().unwrap_or(0) + 1;
        let status = if attempt >= 3 { "done" } else { "uploading" };
        ctx.emit(&StepId::new("poll"), json!({"attempt": attempt}));
        Ok(StepOutcome::done(json!({"status": status, "attempts": attempt})))
    });

    WhileStep::builder("await_upload", pending, poll)
        .max_iterations(10)
        .build()
}

fn build_workflow() -> Result<Workflow, WorkflowError> {
    let thumbnails = ForEachStep::new("thumbnails", render_thumbnail())
        .items(|batch| {
            let images = batch["images"].as_array().ok_or("batch has no images")?;
            Ok(images.clone())
        })
        .concurrency(4);

    Workflow::builder("thumbnail_batch")
        .description("Render thumbnails and wait for the upload")
        .add_step(thumbnails)
        .add_step(FnStep::new("start_upload", |rendered, ctx| async move {
            ctx.store().insert("thumbnails", rendered);
            Ok(StepOutcome::done(json!({"status": "queued"})))
        }))
        .add_step(upload_job()?)
        .finalize(|upload| {
            Ok(json!({
                "upload": upload,
                "finished": true,
            }))
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let workflow = build_workflow()?;
    println!(
        "Graph: {}",
        serde_json::to_string_pretty(&workflow.inspect())?
    );

    let images: Vec<Value> = (1..=10).map(|i| json!(format!("img_{i:02}.png"))).collect();
    let deadline = AbortSignal::new();
    let timer = deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        timer.abort("batch deadline exceeded");
    });

    let run = workflow.create_run(None);
    let options = RunOptions::new(json!({"images": images}))
        .signal(deadline)
        .event_sink(|event: tsuzuri::WorkflowEvent| {
            if let tsuzuri::WorkflowEvent::Custom { payload, .. } = event {
                println!("  progress: {payload}");
            }
        });

    match run.start(options).await {
        Ok(result) => {
            println!("Status: {}", result.status);
            println!("Rendered: {:?}", run.store().get::<u32>("rendered"));
            println!("Output: {}", result.into_output()?);
        }
        Err(e) if e.is_abort() => println!("Batch aborted: {e}"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
