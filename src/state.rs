//! Per-task workflow bookkeeping shared between the executor and the
//! coroutine. Only one of the two is runnable at any instant, so the mutex
//! around this state is never contended.

use std::any::Any;
use std::collections::HashMap;

use tracing::warn;

use crate::command::{Command, CommandKind, CommandState};
use crate::error::FailureDetails;
use crate::history::EventKind;
use crate::{Payload, WorkflowInstance};

/// Signal channels hold enough slack that signal ingestion never blocks in
/// practice.
pub(crate) const SIGNAL_CHANNEL_CAPACITY: usize = 10_000;

/// Type-erased resolver for a tracked future. Decodes the completion payload
/// into the future's concrete type.
pub(crate) type FutureResolver = Box<dyn FnOnce(Result<Payload, FailureDetails>) + Send>;

pub(crate) struct SignalChannelEntry {
    /// Decodes a raw signal payload and pushes it into the typed channel.
    pub deliver: Box<dyn Fn(Payload) + Send>,
    /// The typed `Channel<T>`, recovered by downcast on repeat lookups.
    pub channel: Box<dyn Any + Send>,
}

pub(crate) struct WorkflowState {
    pub instance: WorkflowInstance,
    pub replaying: bool,
    next_schedule_event_id: u64,
    pub commands: Vec<Command>,
    tracked_futures: HashMap<u64, FutureResolver>,
    signal_channels: HashMap<String, SignalChannelEntry>,
    pending_signals: HashMap<String, Vec<Payload>>,
}

impl WorkflowState {
    pub fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            replaying: false,
            next_schedule_event_id: 1,
            commands: Vec::new(),
            tracked_futures: HashMap::new(),
            signal_channels: HashMap::new(),
            pending_signals: HashMap::new(),
        }
    }

    /// Allocate the next schedule event id. Stable across replays because the
    /// workflow function re-executes the same schedule sequence.
    pub fn next_schedule_event_id(&mut self) -> u64 {
        let id = self.next_schedule_event_id;
        self.next_schedule_event_id += 1;
        id
    }

    pub fn add_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn command_mut(&mut self, schedule_event_id: u64) -> Option<&mut Command> {
        self.commands
            .iter_mut()
            .find(|c| c.schedule_event_id == schedule_event_id)
    }

    /// Fold a replayed schedule event into the matching command, marking it
    /// committed so it is not re-emitted. A missing or mismatched command
    /// means the workflow code no longer reproduces its recorded decisions.
    pub fn mark_scheduled(&mut self, schedule_event_id: u64, kind: &EventKind) -> Result<(), String> {
        let mut saw_id = false;
        for command in self
            .commands
            .iter_mut()
            .filter(|c| c.schedule_event_id == schedule_event_id)
        {
            saw_id = true;
            if command.matches_schedule_event(kind) {
                command.state = CommandState::Committed;
                return Ok(());
            }
        }
        if saw_id {
            Err(format!(
                "schedule event {schedule_event_id} does not match the command the workflow produced"
            ))
        } else {
            Err(format!(
                "no command for replayed schedule event {schedule_event_id}"
            ))
        }
    }

    pub fn track_future(&mut self, schedule_event_id: u64, resolver: FutureResolver) {
        self.tracked_futures.insert(schedule_event_id, resolver);
    }

    pub fn take_future(&mut self, schedule_event_id: u64) -> Option<FutureResolver> {
        self.tracked_futures.remove(&schedule_event_id)
    }

    pub fn remove_future(&mut self, schedule_event_id: u64) {
        self.tracked_futures.remove(&schedule_event_id);
    }

    /// Deliver a signal to the named channel, or buffer it until the workflow
    /// creates one.
    pub fn deliver_signal(&mut self, name: &str, arg: Payload) {
        match self.signal_channels.get(name) {
            Some(entry) => (entry.deliver)(arg),
            None => self
                .pending_signals
                .entry(name.to_string())
                .or_default()
                .push(arg),
        }
    }

    pub fn signal_channel_entry(&self, name: &str) -> Option<&SignalChannelEntry> {
        self.signal_channels.get(name)
    }

    /// Register the channel for `name` and return the signals that arrived
    /// before it existed, in arrival order.
    pub fn insert_signal_channel(&mut self, name: &str, entry: SignalChannelEntry) -> Vec<Payload> {
        self.signal_channels.insert(name.to_string(), entry);
        self.pending_signals.remove(name).unwrap_or_default()
    }

    /// Record the workflow function's result as the completion command.
    pub fn complete(&mut self, result: Result<Payload, FailureDetails>) {
        if self
            .commands
            .iter()
            .any(|c| matches!(c.kind, CommandKind::CompleteWorkflow { .. }))
        {
            warn!(instance_id = %self.instance.instance_id, "workflow completion recorded twice");
            return;
        }
        self.add_command(Command::new(0, CommandKind::CompleteWorkflow { result }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState::new(WorkflowInstance::new("i", "e"))
    }

    #[test]
    fn schedule_event_ids_are_sequential() {
        let mut st = state();
        assert_eq!(st.next_schedule_event_id(), 1);
        assert_eq!(st.next_schedule_event_id(), 2);
    }

    #[test]
    fn mark_scheduled_commits_matching_command() {
        let mut st = state();
        st.add_command(Command::new(
            1,
            CommandKind::ScheduleActivity {
                name: "A".into(),
                inputs: vec![],
            },
        ));
        st.mark_scheduled(
            1,
            &EventKind::ActivityScheduled {
                name: "A".into(),
                inputs: vec![],
            },
        )
        .unwrap();
        assert_eq!(st.command_mut(1).unwrap().state, CommandState::Committed);
    }

    #[test]
    fn mark_scheduled_rejects_mismatch() {
        let mut st = state();
        st.add_command(Command::new(
            1,
            CommandKind::ScheduleActivity {
                name: "A".into(),
                inputs: vec![],
            },
        ));
        assert!(st.mark_scheduled(1, &EventKind::TimerScheduled { fire_at_ms: 1 }).is_err());
        assert!(st
            .mark_scheduled(
                9,
                &EventKind::ActivityScheduled {
                    name: "A".into(),
                    inputs: vec![],
                },
            )
            .is_err());
    }

    #[test]
    fn signals_buffer_until_channel_exists() {
        let mut st = state();
        st.deliver_signal("go", b"1".to_vec());
        st.deliver_signal("go", b"2".to_vec());
        let pending = st.insert_signal_channel(
            "go",
            SignalChannelEntry {
                deliver: Box::new(|_| {}),
                channel: Box::new(()),
            },
        );
        assert_eq!(pending, vec![b"1".to_vec(), b"2".to_vec()]);
        assert!(st.insert_signal_channel(
            "go",
            SignalChannelEntry {
                deliver: Box::new(|_| {}),
                channel: Box::new(()),
            },
        )
        .is_empty());
    }

    #[test]
    fn complete_is_recorded_once() {
        let mut st = state();
        st.complete(Ok(vec![]));
        st.complete(Ok(vec![]));
        assert_eq!(st.commands.len(), 1);
    }
}
