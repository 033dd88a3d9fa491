//! History events, the authoritative persisted state of a workflow instance.

use serde::{Deserialize, Serialize};

use crate::error::FailureDetails;
use crate::{new_guid, now_ms, Payload, WorkflowInstance};

/// One entry of an instance's event log.
///
/// `id` is globally unique; ids generated by one process are monotonic, so
/// lexicographic id order matches creation order. `schedule_event_id` links a
/// completion event to the schedule event that requested it; lifecycle events
/// carry 0. `visible_at_ms` defers delivery of a pending event until a
/// wall-clock time, which is how timers fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub schedule_event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_at_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The closed set of event kinds and their attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    WorkflowExecutionStarted {
        name: String,
        inputs: Payload,
    },
    WorkflowExecutionFinished {
        result: Option<Payload>,
        error: Option<FailureDetails>,
    },
    WorkflowCancellationRequested,
    ActivityScheduled {
        name: String,
        inputs: Payload,
    },
    ActivityCompleted {
        result: Payload,
    },
    ActivityFailed {
        details: FailureDetails,
    },
    TimerScheduled {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    TimerCanceled,
    SubWorkflowScheduled {
        name: String,
        instance_id: String,
        inputs: Payload,
    },
    SubWorkflowCompleted {
        result: Payload,
    },
    SubWorkflowFailed {
        details: FailureDetails,
    },
    SignalReceived {
        name: String,
        arg: Payload,
    },
    SideEffectResult {
        result: Payload,
    },
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: new_guid(),
            timestamp_ms: now_ms(),
            schedule_event_id: 0,
            visible_at_ms: None,
            kind,
        }
    }

    pub fn with_schedule_event_id(mut self, schedule_event_id: u64) -> Self {
        self.schedule_event_id = schedule_event_id;
        self
    }

    pub fn with_visible_at(mut self, visible_at_ms: u64) -> Self {
        self.visible_at_ms = Some(visible_at_ms);
        self
    }

    /// Short kind name for logs.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventKind::WorkflowExecutionFinished { .. } => "WorkflowExecutionFinished",
            EventKind::WorkflowCancellationRequested => "WorkflowCancellationRequested",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerScheduled { .. } => "TimerScheduled",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::TimerCanceled => "TimerCanceled",
            EventKind::SubWorkflowScheduled { .. } => "SubWorkflowScheduled",
            EventKind::SubWorkflowCompleted { .. } => "SubWorkflowCompleted",
            EventKind::SubWorkflowFailed { .. } => "SubWorkflowFailed",
            EventKind::SignalReceived { .. } => "SignalReceived",
            EventKind::SideEffectResult { .. } => "SideEffectResult",
        }
    }

    /// Whether this event ends the instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::WorkflowExecutionFinished { .. })
    }
}

/// An event addressed to a specific instance, produced while executing a
/// workflow task for another (or the same) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance: WorkflowInstance,
    pub event: Event,
}
