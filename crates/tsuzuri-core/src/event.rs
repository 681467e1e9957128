//! Progress events and the sinks that receive them.
//!
//! Events are emitted synchronously while a run progresses, so their order
//! within one run matches execution order.

use crate::context::RunStatus;
use crate::step::StepId;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The run started executing.
    RunStarted {
        /// The workflow being run.
        workflow_id: String,
        /// The run that started.
        run_id: String,
    },
    /// A top-level step is about to execute.
    StepStarted {
        /// The run executing the step.
        run_id: String,
        /// The step about to execute.
        step_id: StepId,
    },
    /// A top-level step produced its output.
    StepCompleted {
        /// The run executing the step.
        run_id: String,
        /// The step that completed.
        step_id: StepId,
        /// The step's validated output.
        output: Value,
    },
    /// A top-level step failed.
    StepFailed {
        /// The run executing the step.
        run_id: String,
        /// The step that failed.
        step_id: StepId,
        /// Display form of the step's error.
        error: String,
    },
    /// A step asked for external input.
    StepSuspended {
        /// The run that is now parked.
        run_id: String,
        /// The step waiting for input.
        step_id: StepId,
        /// What the step handed to the outside world.
        payload: Value,
    },
    /// The run reached a terminal or parked status.
    RunFinished {
        /// The run that finished.
        run_id: String,
        /// Its status at that point.
        status: RunStatus,
    },
    /// A handler reported progress through `RunContext::emit`.
    Custom {
        /// The run executing the handler.
        run_id: String,
        /// The step given to `emit`.
        step_id: StepId,
        /// The reported progress.
        payload: Value,
    },
}

/// Receives run events.
///
/// Notification is fire-and-forget: implementations must not block the
/// engine and cannot fail the run.
pub trait EventSink: Send + Sync {
    /// Called for every event.
    fn notify(&self, event: WorkflowEvent);
}

impl<F> EventSink for F
where
    F: Fn(WorkflowEvent) + Send + Sync,
{
    fn notify(&self, event: WorkflowEvent) {
        self(event)
    }
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn notify(&self, _event: WorkflowEvent) {}
}

/// A sink forwarding events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls a run.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl ChannelSink {
    /// Creates a sink and the receiver it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Creates a sink from an existing sender.
    pub fn new(sender: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: WorkflowEvent) {
        // receiver may have been dropped
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut receiver) = ChannelSink::channel();

        sink.notify(WorkflowEvent::StepStarted {
            run_id: "r".to_string(),
            step_id: StepId::new("a"),
        });
        sink.notify(WorkflowEvent::RunFinished {
            run_id: "r".to_string(),
            status: RunStatus::Completed,
        });

        assert!(matches!(
            receiver.try_recv(),
            Ok(WorkflowEvent::StepStarted { .. })
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(WorkflowEvent::RunFinished { .. })
        ));
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |event: WorkflowEvent| seen.lock().expect("lock").push(event);

        sink.notify(WorkflowEvent::Custom {
            run_id: "r".to_string(),
            step_id: StepId::new("a"),
            payload: json!({"progress": 0.5}),
        });

        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::StepStarted {
            run_id: "r1".to_string(),
            step_id: StepId::new("fetch"),
        };
        assert_eq!(
            serde_json::to_value(&event).expect("serializable"),
            json!({"type": "step_started", "run_id": "r1", "step_id": "fetch"})
        );
    }
}
