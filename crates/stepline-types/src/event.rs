//! Event types for the Stepline engine event bus.
//!
//! `EngineEvent` is the unified event type broadcast during workflow
//! execution. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels. Analytics and audit sinks subscribe to the bus;
//! the engine never depends on their implementations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
///
/// Used by the event bus to communicate workflow and step lifecycle to
/// subscribers (analytics, audit, UI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow run has started.
    WorkflowStarted {
        workflow_id: Uuid,
        name: String,
        step_count: usize,
    },

    /// A step has been launched.
    StepStarted {
        workflow_id: Uuid,
        step_id: String,
        step_name: String,
        action: String,
    },

    /// A step completed successfully.
    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step failed (including timeouts).
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A workflow run finished with all steps resolved and no stopping
    /// failure.
    WorkflowCompleted {
        workflow_id: Uuid,
        duration_seconds: f64,
        steps_completed: usize,
    },

    /// A workflow run failed.
    WorkflowFailed {
        workflow_id: Uuid,
        duration_seconds: f64,
        errors: Vec<String>,
    },

    /// A workflow run was cancelled.
    WorkflowCancelled { workflow_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tagged() {
        let event = EngineEvent::WorkflowStarted {
            workflow_id: Uuid::now_v7(),
            name: "digest".to_string(),
            step_count: 3,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "workflow_started");
        assert_eq!(value["step_count"], 3);

        let restored: EngineEvent = serde_json::from_value(value).unwrap();
        assert!(matches!(
            restored,
            EngineEvent::WorkflowStarted { step_count: 3, .. }
        ));
    }
}
