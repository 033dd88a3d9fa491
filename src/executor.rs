//! The replay executor.
//!
//! One workflow task at a time: construct (or recover) the instance's
//! coroutine, feed replayed history and then new events into the shared
//! state, pumping the coroutine to quiescence between events, and harvest the
//! pending commands as this task's output. Replaying the same history always
//! produces the same command sequence; divergence is a
//! [`ExecutorError::NonDeterministic`] failure and the task is not committed.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::backend::{TaskKind, WorkflowTask};
use crate::command::{Command, CommandKind, CommandState};
use crate::converter::Converter;
use crate::error::FailureDetails;
use crate::history::{Event, EventKind, WorkflowEvent};
use crate::registry::Registry;
use crate::state::WorkflowState;
use crate::sync::context::{CancelScope, WorkflowContext};
use crate::sync::coroutine::{Coroutine, Detached};
use crate::{new_guid, Payload, WorkflowInstance};

#[derive(Debug)]
pub enum ExecutorError {
    /// Replay produced commands that do not match recorded history.
    NonDeterministic(String),
    WorkflowNotRegistered(String),
    /// The task carried no `WorkflowExecutionStarted` event.
    MissingStartEvent,
    /// A continuation task arrived but the in-memory state for the instance
    /// is gone. The task is abandoned and redelivered with full history once
    /// the lease and stickiness expire.
    MissingCache,
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::NonDeterministic(msg) => write!(f, "non-deterministic workflow: {msg}"),
            ExecutorError::WorkflowNotRegistered(name) => write!(f, "workflow not registered: {name}"),
            ExecutorError::MissingStartEvent => write!(f, "task has no start event"),
            ExecutorError::MissingCache => write!(f, "continuation task without cached state"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// What one task execution committed: events to fold into the instance's own
/// history, events addressed to other instances, and the harvested commands.
pub struct ExecutionOutput {
    pub executed_events: Vec<Event>,
    pub produced_events: Vec<WorkflowEvent>,
    pub completed: bool,
    pub commands: Vec<Command>,
}

/// Live in-memory execution of one instance: its state, parked coroutine and
/// root cancel scope. Dropping it releases the coroutine thread.
pub struct TaskRun {
    state: Arc<Mutex<WorkflowState>>,
    coroutine: Coroutine,
    scope: Arc<CancelScope>,
    last_event_id: Option<String>,
}

struct CachedRun {
    execution_id: String,
    run: TaskRun,
}

/// Drives workflow tasks and keeps the sticky execution cache.
pub struct WorkflowExecutor {
    registry: Arc<Registry>,
    converter: Arc<dyn Converter>,
    cache: Mutex<HashMap<String, CachedRun>>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<Registry>, converter: Arc<dyn Converter>) -> Self {
        Self {
            registry,
            converter,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one leased task. On success the caller commits the output and
    /// then either retains the run for continuations or drops it.
    pub fn execute(&self, task: &WorkflowTask) -> Result<(ExecutionOutput, TaskRun), ExecutorError> {
        match task.kind {
            TaskKind::Continuation => self.execute_continuation(task),
            TaskKind::New => self.execute_fresh(task),
        }
    }

    /// Keep a non-terminal run for the instance's next continuation task.
    pub fn retain(&self, run: TaskRun) {
        let instance = {
            let st = run.state.lock().unwrap_or_else(|e| e.into_inner());
            st.instance.clone()
        };
        self.lock_cache().insert(
            instance.instance_id.clone(),
            CachedRun {
                execution_id: instance.execution_id,
                run,
            },
        );
    }

    pub fn evict(&self, instance_id: &str) {
        self.lock_cache().remove(instance_id);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedRun>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn execute_continuation(&self, task: &WorkflowTask) -> Result<(ExecutionOutput, TaskRun), ExecutorError> {
        let Some(cached) = self.lock_cache().remove(&task.instance.instance_id) else {
            return Err(ExecutorError::MissingCache);
        };
        let stale = cached.execution_id != task.instance.execution_id
            || cached.run.last_event_id.as_deref() != task.history.last().map(|e| e.id.as_str());
        if stale {
            debug!(instance_id = %task.instance.instance_id, "cached state is stale, refusing continuation");
            return Err(ExecutorError::MissingCache);
        }
        let mut run = cached.run;
        let new_events = self.fold_new_events(&run, task)?;
        let output = self.harvest(&mut run, new_events);
        Ok((output, run))
    }

    fn execute_fresh(&self, task: &WorkflowTask) -> Result<(ExecutionOutput, TaskRun), ExecutorError> {
        // A full-history task supersedes whatever the cache still holds.
        self.evict(&task.instance.instance_id);

        let (name, inputs) = find_start_event(task).ok_or(ExecutorError::MissingStartEvent)?;
        let handler = self
            .registry
            .workflow(&name)
            .ok_or_else(|| ExecutorError::WorkflowNotRegistered(name.clone()))?;

        let state = Arc::new(Mutex::new(WorkflowState::new(task.instance.clone())));
        let scope = CancelScope::new();
        let mut run = {
            let body_state = state.clone();
            let body_scope = scope.clone();
            let body_converter = self.converter.clone();
            let coroutine = Coroutine::spawn(move |yielder| {
                let ctx = WorkflowContext::new(yielder, body_state.clone(), body_scope, body_converter);
                let invoked = catch_unwind(AssertUnwindSafe(|| handler.invoke(ctx, inputs)));
                let outcome = match invoked {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(err)) => Err(err.to_failure_details()),
                    Err(payload) => {
                        if payload.is::<Detached>() {
                            resume_unwind(payload);
                        }
                        Err(FailureDetails::error(panic_message(payload)))
                    }
                };
                body_state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .complete(outcome);
            });
            TaskRun {
                state,
                coroutine,
                scope,
                last_event_id: None,
            }
        };

        let replaying = !task.history.is_empty();
        run.state.lock().unwrap_or_else(|e| e.into_inner()).replaying = replaying;
        for event in &task.history {
            self.apply_event(&run, event)?;
            self.pump(&run);
        }
        run.state.lock().unwrap_or_else(|e| e.into_inner()).replaying = false;

        let new_events = self.fold_new_events(&run, task)?;
        let output = self.harvest(&mut run, new_events);
        Ok((output, run))
    }

    /// Sort the task's new events by id and feed them in, pumping between
    /// each. Ids are monotonic, so this keeps arrival order within a source
    /// while giving concurrent completions one stable order.
    fn fold_new_events(&self, run: &TaskRun, task: &WorkflowTask) -> Result<Vec<Event>, ExecutorError> {
        let mut new_events = task.new_events.clone();
        new_events.sort_by(|a, b| a.id.cmp(&b.id));
        for event in &new_events {
            self.apply_event(run, event)?;
            self.pump(run);
        }
        Ok(new_events)
    }

    /// Fold one event into the run's state.
    fn apply_event(&self, run: &TaskRun, event: &Event) -> Result<(), ExecutorError> {
        let schedule_event_id = event.schedule_event_id;
        match &event.kind {
            EventKind::WorkflowExecutionStarted { .. } => {}
            EventKind::WorkflowExecutionFinished { .. } => {
                warn!(event_id = %event.id, "finished event delivered to a running instance, ignoring");
            }
            EventKind::WorkflowCancellationRequested => run.scope.cancel(),
            EventKind::ActivityScheduled { .. }
            | EventKind::TimerScheduled { .. }
            | EventKind::SubWorkflowScheduled { .. }
            | EventKind::TimerCanceled => {
                run.state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .mark_scheduled(schedule_event_id, &event.kind)
                    .map_err(ExecutorError::NonDeterministic)?;
            }
            EventKind::SideEffectResult { result } => {
                run.state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .mark_scheduled(schedule_event_id, &event.kind)
                    .map_err(ExecutorError::NonDeterministic)?;
                self.resolve(run, schedule_event_id, Ok(result.clone()));
            }
            EventKind::ActivityCompleted { result } => {
                self.resolve(run, schedule_event_id, Ok(result.clone()));
            }
            EventKind::ActivityFailed { details } => {
                self.resolve(run, schedule_event_id, Err(details.clone()));
            }
            EventKind::TimerFired { .. } => {
                self.resolve(run, schedule_event_id, Ok(Vec::new()));
            }
            EventKind::SubWorkflowCompleted { result } => {
                self.resolve(run, schedule_event_id, Ok(result.clone()));
            }
            EventKind::SubWorkflowFailed { details } => {
                self.resolve(run, schedule_event_id, Err(details.clone()));
            }
            EventKind::SignalReceived { name, arg } => {
                run.state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .deliver_signal(name, arg.clone());
            }
        }
        Ok(())
    }

    fn resolve(&self, run: &TaskRun, schedule_event_id: u64, result: Result<Payload, FailureDetails>) {
        let resolver = run
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_future(schedule_event_id);
        match resolver {
            Some(resolve) => resolve(result),
            // A canceled timer can still fire; its future is already gone.
            None => debug!(schedule_event_id, "completion without a tracked future, dropping"),
        }
    }

    /// Resume the coroutine until it finishes or a full cycle passes without
    /// progress.
    fn pump(&self, run: &TaskRun) {
        loop {
            if run.coroutine.finished() {
                return;
            }
            run.coroutine.resume();
            if !run.coroutine.take_progress() {
                return;
            }
        }
    }

    /// Turn the pending commands into events and mark them committed.
    fn harvest(&self, run: &mut TaskRun, consumed_events: Vec<Event>) -> ExecutionOutput {
        let mut st = run.state.lock().unwrap_or_else(|e| e.into_inner());
        let instance = st.instance.clone();
        let mut executed_events = consumed_events;
        let mut produced_events = Vec::new();
        let mut harvested = Vec::new();
        let mut completed = false;

        for command in st.commands.iter_mut().filter(|c| c.state == CommandState::Pending) {
            let schedule_event_id = command.schedule_event_id;
            match &command.kind {
                CommandKind::ScheduleActivity { name, inputs } => {
                    executed_events.push(
                        Event::new(EventKind::ActivityScheduled {
                            name: name.clone(),
                            inputs: inputs.clone(),
                        })
                        .with_schedule_event_id(schedule_event_id),
                    );
                }
                CommandKind::ScheduleTimer { fire_at_ms } => {
                    executed_events.push(
                        Event::new(EventKind::TimerScheduled {
                            fire_at_ms: *fire_at_ms,
                        })
                        .with_schedule_event_id(schedule_event_id),
                    );
                    produced_events.push(WorkflowEvent {
                        instance: instance.clone(),
                        event: Event::new(EventKind::TimerFired {
                            fire_at_ms: *fire_at_ms,
                        })
                        .with_schedule_event_id(schedule_event_id)
                        .with_visible_at(*fire_at_ms),
                    });
                }
                CommandKind::ScheduleSubWorkflow {
                    name,
                    instance_id,
                    inputs,
                } => {
                    executed_events.push(
                        Event::new(EventKind::SubWorkflowScheduled {
                            name: name.clone(),
                            instance_id: instance_id.clone(),
                            inputs: inputs.clone(),
                        })
                        .with_schedule_event_id(schedule_event_id),
                    );
                    let child = WorkflowInstance::new_sub_workflow(
                        instance_id.clone(),
                        new_guid(),
                        instance.instance_id.clone(),
                        schedule_event_id,
                    );
                    produced_events.push(WorkflowEvent {
                        instance: child,
                        event: Event::new(EventKind::WorkflowExecutionStarted {
                            name: name.clone(),
                            inputs: inputs.clone(),
                        }),
                    });
                }
                CommandKind::CancelTimer => {
                    executed_events.push(
                        Event::new(EventKind::TimerCanceled).with_schedule_event_id(schedule_event_id),
                    );
                }
                CommandKind::SideEffect { result } => {
                    executed_events.push(
                        Event::new(EventKind::SideEffectResult {
                            result: result.clone(),
                        })
                        .with_schedule_event_id(schedule_event_id),
                    );
                }
                CommandKind::CompleteWorkflow { result } => {
                    completed = true;
                    let (payload, error) = match result {
                        Ok(p) => (Some(p.clone()), None),
                        Err(d) => (None, Some(d.clone())),
                    };
                    executed_events.push(Event::new(EventKind::WorkflowExecutionFinished {
                        result: payload,
                        error,
                    }));
                    if let (Some(parent_id), Some(parent_schedule_event_id)) = (
                        instance.parent_instance_id.clone(),
                        instance.parent_schedule_event_id,
                    ) {
                        let kind = match result {
                            Ok(p) => EventKind::SubWorkflowCompleted { result: p.clone() },
                            Err(d) => EventKind::SubWorkflowFailed { details: d.clone() },
                        };
                        produced_events.push(WorkflowEvent {
                            instance: WorkflowInstance::new(parent_id, ""),
                            event: Event::new(kind).with_schedule_event_id(parent_schedule_event_id),
                        });
                    }
                }
            }
            command.state = CommandState::Committed;
            harvested.push(command.clone());
        }
        drop(st);

        run.last_event_id = executed_events.last().map(|e| e.id.clone());
        ExecutionOutput {
            executed_events,
            produced_events,
            completed,
            commands: harvested,
        }
    }
}

fn find_start_event(task: &WorkflowTask) -> Option<(String, Payload)> {
    task.history
        .iter()
        .chain(task.new_events.iter())
        .find_map(|e| match &e.kind {
            EventKind::WorkflowExecutionStarted { name, inputs } => Some((name.clone(), inputs.clone())),
            _ => None,
        })
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "workflow panicked".to_string()
    }
}
