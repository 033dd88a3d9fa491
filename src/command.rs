//! Commands: a workflow's externally visible decisions for one task.
//!
//! Commands live only in memory. A `Pending` command is harvested at the end
//! of the task and materialized into events; replaying the matching schedule
//! event marks the re-emitted command `Committed` so it is not produced
//! again. A command withdrawn by cancellation before commit becomes
//! `Canceled` and leaves no trace in history.

use crate::error::FailureDetails;
use crate::history::EventKind;
use crate::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Committed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    ScheduleActivity {
        name: String,
        inputs: Payload,
    },
    ScheduleSubWorkflow {
        name: String,
        instance_id: String,
        inputs: Payload,
    },
    ScheduleTimer {
        fire_at_ms: u64,
    },
    CancelTimer,
    SideEffect {
        result: Payload,
    },
    CompleteWorkflow {
        result: Result<Payload, FailureDetails>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// For `CancelTimer` this is the canceled timer's schedule event id; for
    /// `CompleteWorkflow` it is 0.
    pub schedule_event_id: u64,
    pub state: CommandState,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(schedule_event_id: u64, kind: CommandKind) -> Self {
        Self {
            schedule_event_id,
            state: CommandState::Pending,
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            CommandKind::ScheduleActivity { .. } => "ScheduleActivity",
            CommandKind::ScheduleSubWorkflow { .. } => "ScheduleSubWorkflow",
            CommandKind::ScheduleTimer { .. } => "ScheduleTimer",
            CommandKind::CancelTimer => "CancelTimer",
            CommandKind::SideEffect { .. } => "SideEffect",
            CommandKind::CompleteWorkflow { .. } => "CompleteWorkflow",
        }
    }

    /// Whether a replayed schedule event matches this command.
    ///
    /// Activities and sub-workflows compare attributes so that code drift
    /// between runs is caught; timers recompute their target each run and
    /// side effects recompute nothing during replay, so both match on kind
    /// alone.
    pub fn matches_schedule_event(&self, kind: &EventKind) -> bool {
        match (&self.kind, kind) {
            (
                CommandKind::ScheduleActivity { name, inputs },
                EventKind::ActivityScheduled {
                    name: event_name,
                    inputs: event_inputs,
                },
            ) => name == event_name && inputs == event_inputs,
            (
                CommandKind::ScheduleSubWorkflow {
                    name,
                    instance_id,
                    inputs,
                },
                EventKind::SubWorkflowScheduled {
                    name: event_name,
                    instance_id: event_instance,
                    inputs: event_inputs,
                },
            ) => name == event_name && instance_id == event_instance && inputs == event_inputs,
            (CommandKind::ScheduleTimer { .. }, EventKind::TimerScheduled { .. }) => true,
            (CommandKind::CancelTimer, EventKind::TimerCanceled) => true,
            (CommandKind::SideEffect { .. }, EventKind::SideEffectResult { .. }) => true,
            _ => false,
        }
    }
}
