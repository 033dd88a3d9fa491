//! The workflow-side API surface.
//!
//! A `WorkflowContext` is handed to the workflow function and carries the
//! coroutine handle, the shared per-task state and a cancel scope. All
//! scheduling goes through it: activities, sub-workflows, timers, signals and
//! side effects.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::command::{Command, CommandKind, CommandState};
use crate::converter::{self, Converter};
use crate::error::WorkflowError;
use crate::registry::fn_name;
use crate::retry::RetryPolicy;
use crate::state::{FutureResolver, SignalChannelEntry, WorkflowState, SIGNAL_CHANNEL_CAPACITY};
use crate::sync::channel::Channel;
use crate::sync::coroutine::Yielder;
use crate::sync::future::Future;
use crate::{now_ms, Payload, WorkflowInstance};

/// Options for [`WorkflowContext::execute_activity`].
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    pub retry: RetryPolicy,
}

/// Options for [`WorkflowContext::create_sub_workflow`].
#[derive(Debug, Clone)]
pub struct SubWorkflowOptions {
    pub instance_id: String,
    pub retry: RetryPolicy,
}

impl SubWorkflowOptions {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Node of the cancellation tree. Canceling a scope closes its done channel
/// and cascades to scopes derived from it.
pub(crate) struct CancelScope {
    done: Channel<()>,
    children: Mutex<Vec<Arc<CancelScope>>>,
}

impl CancelScope {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Channel::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn cancel(self: &Arc<Self>) {
        if self.done.closed() {
            return;
        }
        self.done.close();
        let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|e| e.into_inner()));
        for child in children {
            child.cancel();
        }
    }

    fn adopt(self: &Arc<Self>, child: Arc<CancelScope>) {
        if self.done.closed() {
            child.cancel();
            return;
        }
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child);
    }
}

/// Context threaded through a workflow function.
#[derive(Clone)]
pub struct WorkflowContext {
    yielder: Arc<Yielder>,
    state: Arc<Mutex<WorkflowState>>,
    scope: Arc<CancelScope>,
    converter: Arc<dyn Converter>,
}

impl WorkflowContext {
    pub(crate) fn new(
        yielder: Arc<Yielder>,
        state: Arc<Mutex<WorkflowState>>,
        scope: Arc<CancelScope>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            yielder,
            state,
            scope,
            converter,
        }
    }

    pub(crate) fn yielder(&self) -> &Yielder {
        &self.yielder
    }

    fn state(&self) -> MutexGuard<'_, WorkflowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity of the executing instance.
    pub fn instance(&self) -> WorkflowInstance {
        self.state().instance.clone()
    }

    /// True while the function is catching up to previously recorded history.
    /// Use it to skip non-durable effects such as logging during replay.
    pub fn replaying(&self) -> bool {
        self.state().replaying
    }

    /// Channel that closes when this context is canceled.
    pub fn done(&self) -> Channel<()> {
        self.scope.done.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.scope.done.closed()
    }

    /// Derive a child context plus a function that cancels it.
    pub fn with_cancel(&self) -> (WorkflowContext, impl Fn() + Send + Sync + 'static) {
        let child = CancelScope::new();
        self.scope.adopt(child.clone());
        let ctx = WorkflowContext {
            scope: child.clone(),
            ..self.clone()
        };
        let cancel = move || child.cancel();
        (ctx, cancel)
    }

    /// Copy of this context that ignores cancellation of its ancestors. Used
    /// for cleanup blocks that must still schedule work after a cancel.
    pub fn new_disconnected(&self) -> WorkflowContext {
        WorkflowContext {
            scope: CancelScope::new(),
            ..self.clone()
        }
    }

    // ----- activities -----

    /// Schedule `activity` (an async fn registered on the worker) and return
    /// a future for its result. The activity name is derived from the
    /// function's type path.
    pub fn execute_activity<F, I, O>(&self, options: ActivityOptions, _activity: F, input: I) -> Future<O>
    where
        I: Serialize,
        O: DeserializeOwned + Clone + Send + 'static,
    {
        self.execute_activity_named(options, &fn_name::<F>(), input)
    }

    /// Schedule an activity by explicit name.
    pub fn execute_activity_named<I, O>(&self, options: ActivityOptions, name: &str, input: I) -> Future<O>
    where
        I: Serialize,
        O: DeserializeOwned + Clone + Send + 'static,
    {
        let inputs = match converter::encode(&*self.converter, &input) {
            Ok(p) => p,
            Err(e) => return failed_future(WorkflowError::serialization(e)),
        };
        let name = name.to_string();
        if options.retry.max_attempts <= 1 {
            return self.schedule_activity(&name, inputs);
        }
        let first = self.schedule_activity(&name, inputs.clone());
        Future::with_retry(
            options.retry,
            first,
            Box::new(move |ctx, _attempt| ctx.schedule_activity(&name, inputs.clone())),
        )
    }

    fn schedule_activity<O>(&self, name: &str, inputs: Payload) -> Future<O>
    where
        O: DeserializeOwned + Clone + Send + 'static,
    {
        let fut = Future::<O>::new();
        let schedule_event_id = {
            let mut st = self.state();
            let id = st.next_schedule_event_id();
            st.add_command(Command::new(
                id,
                CommandKind::ScheduleActivity {
                    name: name.to_string(),
                    inputs,
                },
            ));
            st.track_future(id, decode_resolver(self.converter.clone(), fut.clone(), FailureTarget::Activity));
            id
        };
        self.attach_cancellation(schedule_event_id, fut.clone(), false);
        fut
    }

    // ----- sub-workflows -----

    /// Schedule a child workflow instance and return a future for its result.
    pub fn create_sub_workflow<F, I, O>(&self, options: SubWorkflowOptions, _workflow: F, input: I) -> Future<O>
    where
        I: Serialize,
        O: DeserializeOwned + Clone + Send + 'static,
    {
        self.create_sub_workflow_named(options, &fn_name::<F>(), input)
    }

    pub fn create_sub_workflow_named<I, O>(&self, options: SubWorkflowOptions, name: &str, input: I) -> Future<O>
    where
        I: Serialize,
        O: DeserializeOwned + Clone + Send + 'static,
    {
        let inputs = match converter::encode(&*self.converter, &input) {
            Ok(p) => p,
            Err(e) => return failed_future(WorkflowError::serialization(e)),
        };
        let name = name.to_string();
        let base = options.instance_id.clone();
        if options.retry.max_attempts <= 1 {
            return self.schedule_sub_workflow(&name, base, inputs);
        }
        let first = self.schedule_sub_workflow(&name, child_instance_id(&base, 1), inputs.clone());
        Future::with_retry(
            options.retry,
            first,
            Box::new(move |ctx, attempt| {
                // Retried children get a derived instance id so the failed
                // child's history is never reused.
                ctx.schedule_sub_workflow(&name, child_instance_id(&base, attempt), inputs.clone())
            }),
        )
    }

    fn schedule_sub_workflow<O>(&self, name: &str, instance_id: String, inputs: Payload) -> Future<O>
    where
        O: DeserializeOwned + Clone + Send + 'static,
    {
        let fut = Future::<O>::new();
        let schedule_event_id = {
            let mut st = self.state();
            let id = st.next_schedule_event_id();
            st.add_command(Command::new(
                id,
                CommandKind::ScheduleSubWorkflow {
                    name: name.to_string(),
                    instance_id,
                    inputs,
                },
            ));
            st.track_future(
                id,
                decode_resolver(self.converter.clone(), fut.clone(), FailureTarget::SubWorkflow),
            );
            id
        };
        self.attach_cancellation(schedule_event_id, fut.clone(), false);
        fut
    }

    // ----- timers -----

    /// Schedule a durable timer. The future resolves when the timer fires,
    /// or with `Canceled` if this context is canceled first.
    pub fn schedule_timer(&self, delay: Duration) -> Future<()> {
        let fire_at_ms = now_ms().saturating_add(delay.as_millis() as u64);
        let fut = Future::<()>::new();
        let schedule_event_id = {
            let mut st = self.state();
            let id = st.next_schedule_event_id();
            st.add_command(Command::new(id, CommandKind::ScheduleTimer { fire_at_ms }));
            let timer_fut = fut.clone();
            st.track_future(
                id,
                Box::new(move |res| {
                    let outcome = match res {
                        Ok(_) => Ok(()),
                        Err(d) if d.is_canceled() => Err(WorkflowError::Canceled),
                        Err(d) => Err(WorkflowError::application(d.message)),
                    };
                    timer_fut.set(outcome);
                }),
            );
            id
        };
        self.attach_cancellation(schedule_event_id, fut.clone(), true);
        fut
    }

    // ----- signals -----

    /// The signal channel for `name`, created on first use. Signals that
    /// arrived before the channel existed are delivered in arrival order.
    ///
    /// # Panics
    /// Panics if the channel was previously requested with a different type.
    pub fn signal_channel<T>(&self, name: &str) -> Channel<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        {
            let st = self.state();
            if let Some(entry) = st.signal_channel_entry(name) {
                match entry.channel.downcast_ref::<Channel<T>>() {
                    Some(ch) => return ch.clone(),
                    None => panic!("signal channel {name:?} requested with a different payload type"),
                }
            }
        }

        let channel = Channel::<T>::with_capacity(SIGNAL_CHANNEL_CAPACITY);
        let deliver: Box<dyn Fn(Payload) + Send> = {
            let channel = channel.clone();
            let conv = self.converter.clone();
            let name = name.to_string();
            Box::new(move |arg| match converter::decode::<T>(&*conv, &arg) {
                Ok(v) => {
                    if !channel.send_nonblocking(v) {
                        warn!(signal = %name, "signal channel full, dropping signal");
                    }
                }
                Err(e) => warn!(signal = %name, error = %e, "dropping undecodable signal"),
            })
        };
        let pending = self.state().insert_signal_channel(
            name,
            SignalChannelEntry {
                deliver,
                channel: Box::new(channel.clone()),
            },
        );
        for arg in pending {
            match converter::decode::<T>(&*self.converter, &arg) {
                // The channel is freshly created and buffered, so this cannot
                // park the coroutine.
                Ok(v) => channel.send(self, v),
                Err(e) => warn!(signal = %name, error = %e, "dropping undecodable buffered signal"),
            }
        }
        channel
    }

    // ----- side effects -----

    /// Run a non-deterministic computation once and record its result in
    /// history. During replay the recorded value is returned and `f` does not
    /// run.
    pub fn side_effect<T, F>(&self, f: F) -> Future<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        let fut = Future::<T>::new();
        let mut st = self.state();
        let schedule_event_id = st.next_schedule_event_id();
        if st.replaying {
            st.add_command(Command::new(
                schedule_event_id,
                CommandKind::SideEffect { result: Vec::new() },
            ));
            st.track_future(
                schedule_event_id,
                decode_resolver(self.converter.clone(), fut.clone(), FailureTarget::Activity),
            );
            return fut;
        }
        drop(st);

        let v = f();
        let payload = match converter::encode(&*self.converter, &v) {
            Ok(p) => p,
            Err(e) => {
                fut.set(Err(WorkflowError::serialization(e)));
                return fut;
            }
        };
        self.state().add_command(Command::new(
            schedule_event_id,
            CommandKind::SideEffect { result: payload },
        ));
        fut.set(Ok(v));
        fut
    }

    // ----- internal -----

    /// Withdraw the command when this context is canceled before the command
    /// is committed. A committed timer additionally emits a cancel command;
    /// other committed work runs to completion and is awaited normally.
    fn attach_cancellation<O>(&self, schedule_event_id: u64, fut: Future<O>, timer: bool)
    where
        O: Clone + Send + 'static,
    {
        let state = self.state.clone();
        self.scope.done.notify_receivable(Box::new(move |_| {
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(command_state) = st.command_mut(schedule_event_id).map(|c| c.state) else {
                return;
            };
            match command_state {
                CommandState::Pending => {
                    if let Some(cmd) = st.command_mut(schedule_event_id) {
                        cmd.state = CommandState::Canceled;
                    }
                    st.remove_future(schedule_event_id);
                    drop(st);
                    fut.set(Err(WorkflowError::Canceled));
                }
                CommandState::Committed if timer => {
                    // Already resolved means the timer fired first.
                    if st.take_future(schedule_event_id).is_some() {
                        st.add_command(Command::new(schedule_event_id, CommandKind::CancelTimer));
                        drop(st);
                        fut.set(Err(WorkflowError::Canceled));
                    }
                }
                CommandState::Committed | CommandState::Canceled => {}
            }
        }));
    }
}

enum FailureTarget {
    Activity,
    SubWorkflow,
}

fn decode_resolver<O>(conv: Arc<dyn Converter>, fut: Future<O>, target: FailureTarget) -> FutureResolver
where
    O: DeserializeOwned + Clone + Send + 'static,
{
    Box::new(move |res| {
        let outcome = match res {
            Ok(p) => converter::decode::<O>(&*conv, &p).map_err(WorkflowError::serialization),
            Err(d) if d.is_canceled() => Err(WorkflowError::Canceled),
            Err(d) => Err(match target {
                FailureTarget::Activity => WorkflowError::ActivityFailed { message: d.message },
                FailureTarget::SubWorkflow => WorkflowError::SubWorkflowFailed { message: d.message },
            }),
        };
        fut.set(outcome);
    })
}

fn failed_future<O: Clone + Send + 'static>(err: WorkflowError) -> Future<O> {
    let fut = Future::new();
    fut.set(Err(err));
    fut
}

fn child_instance_id(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{base}#r{}", attempt - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_ids_are_stable_per_attempt() {
        assert_eq!(child_instance_id("c", 1), "c");
        assert_eq!(child_instance_id("c", 2), "c#r1");
        assert_eq!(child_instance_id("c", 3), "c#r2");
    }

    #[test]
    fn cancel_scope_cascades_to_children() {
        let root = CancelScope::new();
        let child = CancelScope::new();
        root.adopt(child.clone());
        root.cancel();
        assert!(child.done.closed());
    }

    #[test]
    fn adopting_into_canceled_scope_cancels_immediately() {
        let root = CancelScope::new();
        root.cancel();
        let child = CancelScope::new();
        root.adopt(child.clone());
        assert!(child.done.closed());
    }
}
