//! In-memory backend: instance maps plus bounded FIFO task queues under one
//! async mutex. Semantics match the durable backend, minus durability; leases
//! and stickiness use monotonic timestamps, deferred events re-arm their
//! instance through spawned sleeps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ActivityTask, Backend, BackendError, BackendOptions, TaskKind, WorkflowTask};
use crate::history::{Event, EventKind, WorkflowEvent};
use crate::{new_guid, now_ms, WorkflowInstance};

const ACTIVITY_QUEUE_CAP: usize = 1024;

struct InstanceState {
    instance: WorkflowInstance,
    history: Vec<Event>,
    pending: Vec<Event>,
    completed_at: Option<u64>,
    locked_by: Option<String>,
    locked_until: Option<Instant>,
    sticky_until: Option<Instant>,
    last_worker: Option<String>,
}

impl InstanceState {
    fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            history: Vec::new(),
            pending: Vec::new(),
            completed_at: None,
            locked_by: None,
            locked_until: None,
            sticky_until: None,
            last_worker: None,
        }
    }

    fn has_visible_pending(&self, now_wall: u64) -> bool {
        self.pending
            .iter()
            .any(|e| e.visible_at_ms.map_or(true, |v| v <= now_wall))
    }
}

struct ActivityLease {
    worker: String,
    locked_until: Instant,
    task: ActivityTask,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, InstanceState>,
    workflow_queue: VecDeque<String>,
    queued: HashSet<String>,
    activity_queue: VecDeque<ActivityTask>,
    activity_leases: HashMap<String, ActivityLease>,
}

impl Inner {
    /// Arm the instance for leasing if it has deliverable events and is not
    /// already queued.
    fn enqueue_workflow_task(&mut self, instance_id: &str) {
        let Some(st) = self.instances.get(instance_id) else {
            return;
        };
        if st.completed_at.is_some() || !st.has_visible_pending(now_ms()) {
            return;
        }
        if self.queued.insert(instance_id.to_string()) {
            self.workflow_queue.push_back(instance_id.to_string());
        }
    }
}

/// Development and test backend.
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
    options: BackendOptions,
    worker_name: String,
}

impl InMemoryBackend {
    pub fn new(options: BackendOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            options,
            worker_name: format!("worker-{}", new_guid()),
        }
    }

    /// A handle over the same store under a different worker identity. Lets
    /// tests exercise lease takeover within one process.
    pub fn for_worker(&self, worker_name: impl Into<String>) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options.clone(),
            worker_name: worker_name.into(),
        }
    }

    fn spawn_requeue(&self, instance_id: String, delay: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.lock().await.enqueue_workflow_task(&instance_id);
        });
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn options(&self) -> BackendOptions {
        self.options.clone()
    }

    async fn create_workflow_instance(&self, event: WorkflowEvent) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let instance_id = event.instance.instance_id.clone();
        if let Some(existing) = g.instances.get(&instance_id) {
            if existing.instance.execution_id == event.instance.execution_id {
                return Ok(());
            }
            return Err(BackendError::AlreadyExists);
        }
        let mut st = InstanceState::new(event.instance);
        st.pending.push(event.event);
        g.instances.insert(instance_id.clone(), st);
        g.enqueue_workflow_task(&instance_id);
        Ok(())
    }

    async fn cancel_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        if !g.instances.contains_key(&instance.instance_id) {
            return Err(BackendError::NotFound(format!(
                "workflow instance {}",
                instance.instance_id
            )));
        }
        // The instance itself plus every uncompleted descendant.
        let mut targets = vec![instance.instance_id.clone()];
        let mut cursor = 0;
        while cursor < targets.len() {
            let parent = targets[cursor].clone();
            cursor += 1;
            let children: Vec<String> = g
                .instances
                .values()
                .filter(|st| {
                    st.instance.parent_instance_id.as_deref() == Some(parent.as_str())
                        && st.completed_at.is_none()
                })
                .map(|st| st.instance.instance_id.clone())
                .collect();
            targets.extend(children);
        }
        for target in targets {
            if let Some(st) = g.instances.get_mut(&target) {
                if st.completed_at.is_some() {
                    continue;
                }
                st.pending.push(Event::new(EventKind::WorkflowCancellationRequested));
            }
            g.enqueue_workflow_task(&target);
        }
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let Some(st) = g.instances.get_mut(instance_id) else {
            return Err(BackendError::NotFound(format!("workflow instance {instance_id}")));
        };
        st.pending.push(event);
        g.enqueue_workflow_task(instance_id);
        Ok(())
    }

    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError> {
        let mut requeues: Vec<(String, Duration)> = Vec::new();
        let task = {
            let mut g = self.inner.lock().await;
            let now = Instant::now();
            let now_wall = now_ms();
            let mut leased = None;
            while let Some(instance_id) = g.workflow_queue.pop_front() {
                g.queued.remove(&instance_id);
                let Some(st) = g.instances.get_mut(&instance_id) else {
                    continue;
                };
                if st.completed_at.is_some() {
                    continue;
                }
                // Locked elsewhere; the commit path re-arms leftover events.
                if st.locked_until.map_or(false, |t| t > now) {
                    continue;
                }
                let sticky_active = st.sticky_until.map_or(false, |t| t > now);
                if sticky_active && st.last_worker.as_deref() != Some(self.worker_name.as_str()) {
                    if let Some(until) = st.sticky_until {
                        requeues.push((instance_id.clone(), until.saturating_duration_since(now)));
                    }
                    continue;
                }
                let new_events: Vec<Event> = st
                    .pending
                    .iter()
                    .filter(|e| e.visible_at_ms.map_or(true, |v| v <= now_wall))
                    .cloned()
                    .collect();
                if new_events.is_empty() {
                    if let Some(earliest) = st.pending.iter().filter_map(|e| e.visible_at_ms).min() {
                        requeues.push((
                            instance_id.clone(),
                            Duration::from_millis(earliest.saturating_sub(now_wall)),
                        ));
                    }
                    continue;
                }
                st.locked_by = Some(self.worker_name.clone());
                st.locked_until = Some(now + self.options.workflow_lock_timeout);
                let kind = if sticky_active {
                    TaskKind::Continuation
                } else {
                    TaskKind::New
                };
                let history = match kind {
                    TaskKind::Continuation => st.history.last().cloned().into_iter().collect(),
                    TaskKind::New => st.history.clone(),
                };
                leased = Some(WorkflowTask {
                    instance: st.instance.clone(),
                    history,
                    new_events,
                    kind,
                });
                break;
            }
            leased
        };
        for (instance_id, delay) in requeues {
            self.spawn_requeue(instance_id, delay);
        }
        Ok(task)
    }

    async fn extend_workflow_task(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let Some(st) = g.instances.get_mut(&instance.instance_id) else {
            return Err(BackendError::NotFound(format!(
                "workflow instance {}",
                instance.instance_id
            )));
        };
        if st.locked_by.as_deref() != Some(self.worker_name.as_str()) {
            return Err(BackendError::LostLease);
        }
        st.locked_until = Some(Instant::now() + self.options.workflow_lock_timeout);
        Ok(())
    }

    async fn complete_workflow_task(
        &self,
        instance: &WorkflowInstance,
        executed_events: Vec<Event>,
        produced_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError> {
        let mut deferred: Vec<(String, Duration)> = Vec::new();
        {
            let mut g = self.inner.lock().await;
            let now = Instant::now();
            let now_wall = now_ms();

            let scheduled_activities = executed_events
                .iter()
                .filter(|e| matches!(e.kind, EventKind::ActivityScheduled { .. }))
                .count();
            if g.activity_queue.len() + scheduled_activities > ACTIVITY_QUEUE_CAP {
                return Err(BackendError::retryable("complete_workflow_task", "activity queue full"));
            }

            let (self_instance, completed) = {
                let Some(st) = g.instances.get_mut(&instance.instance_id) else {
                    return Err(BackendError::NotFound(format!(
                        "workflow instance {}",
                        instance.instance_id
                    )));
                };
                if st.locked_by.as_deref() != Some(self.worker_name.as_str())
                    || st.instance.execution_id != instance.execution_id
                {
                    return Err(BackendError::LostLease);
                }

                let executed_ids: HashSet<&str> = executed_events.iter().map(|e| e.id.as_str()).collect();
                st.pending.retain(|e| !executed_ids.contains(e.id.as_str()));
                st.history.extend(executed_events.iter().cloned());

                let completed = executed_events.iter().any(|e| e.is_terminal());
                st.locked_by = None;
                st.locked_until = None;
                st.sticky_until = Some(now + self.options.sticky_timeout);
                st.last_worker = Some(self.worker_name.clone());
                if completed {
                    st.completed_at = Some(now_wall);
                }
                (st.instance.clone(), completed)
            };

            for event in &executed_events {
                if matches!(event.kind, EventKind::ActivityScheduled { .. }) {
                    g.activity_queue.push_back(ActivityTask {
                        id: new_guid(),
                        instance: self_instance.clone(),
                        event: event.clone(),
                    });
                }
            }

            for we in produced_events {
                let target_id = we.instance.instance_id.clone();
                if target_id != instance.instance_id && !g.instances.contains_key(&target_id) {
                    g.instances
                        .insert(target_id.clone(), InstanceState::new(we.instance.clone()));
                }
                let Some(target) = g.instances.get_mut(&target_id) else {
                    continue;
                };
                if target.completed_at.is_some() {
                    debug!(instance_id = %target_id, "dropping event for completed instance");
                    continue;
                }
                let visible_at = we.event.visible_at_ms;
                target.pending.push(we.event);
                match visible_at {
                    Some(v) if v > now_wall => {
                        deferred.push((target_id, Duration::from_millis(v.saturating_sub(now_wall))));
                    }
                    _ => g.enqueue_workflow_task(&target_id),
                }
            }

            if !completed {
                g.enqueue_workflow_task(&instance.instance_id);
            }
        }
        for (instance_id, delay) in deferred {
            self.spawn_requeue(instance_id, delay);
        }
        Ok(())
    }

    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError> {
        let mut g = self.inner.lock().await;
        let now = Instant::now();
        // Expired leases go back to the front of the queue.
        let expired: Vec<String> = g
            .activity_leases
            .iter()
            .filter(|(_, lease)| lease.locked_until <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(lease) = g.activity_leases.remove(&id) {
                warn!(activity_id = %id, "activity lease expired, requeueing");
                g.activity_queue.push_front(lease.task);
            }
        }
        let Some(task) = g.activity_queue.pop_front() else {
            return Ok(None);
        };
        g.activity_leases.insert(
            task.id.clone(),
            ActivityLease {
                worker: self.worker_name.clone(),
                locked_until: now + self.options.activity_lock_timeout,
                task: task.clone(),
            },
        );
        Ok(Some(task))
    }

    async fn extend_activity_task(&self, activity_id: &str) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let options = self.options.clone();
        let Some(lease) = g.activity_leases.get_mut(activity_id) else {
            return Err(BackendError::LostLease);
        };
        if lease.worker != self.worker_name {
            return Err(BackendError::LostLease);
        }
        lease.locked_until = Instant::now() + options.activity_lock_timeout;
        Ok(())
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        activity_id: &str,
        result_event: Event,
    ) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        match g.activity_leases.get(activity_id) {
            Some(lease) if lease.worker == self.worker_name => {}
            _ => return Err(BackendError::LostLease),
        }
        g.activity_leases.remove(activity_id);

        let locked = {
            let Some(st) = g.instances.get_mut(&instance.instance_id) else {
                return Err(BackendError::NotFound(format!(
                    "workflow instance {}",
                    instance.instance_id
                )));
            };
            if st.completed_at.is_some() {
                debug!(instance_id = %instance.instance_id, "instance completed, dropping activity result");
                return Ok(());
            }
            st.pending.push(result_event);
            st.locked_until.map_or(false, |t| t > Instant::now())
        };
        if !locked {
            g.enqueue_workflow_task(&instance.instance_id);
        }
        Ok(())
    }

    async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, BackendError> {
        let g = self.inner.lock().await;
        Ok(g.instances
            .get(instance_id)
            .map(|st| st.history.clone())
            .unwrap_or_default())
    }
}
