//! Storage backends: durable history, pending events, activity tasks and
//! leases.
//!
//! The backend is the only shared mutable state in the system. Every
//! operation on it is transactional; in particular a workflow task commit
//! (pending-event deletion, history append, command materialization, lock
//! release) succeeds or rolls back as a whole.

use std::time::Duration;

use async_trait::async_trait;

use crate::history::{Event, WorkflowEvent};
use crate::WorkflowInstance;

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::BackendError;

/// Lease and stickiness knobs shared by all backends.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Exclusive hold on a leased workflow task. Workers extend at half this
    /// interval; an expired lease makes the commit fail with `LostLease`.
    pub workflow_lock_timeout: Duration,
    pub activity_lock_timeout: Duration,
    /// Affinity window after a commit during which only the last worker may
    /// lease the instance, as a continuation task.
    pub sticky_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            workflow_lock_timeout: Duration::from_secs(60),
            activity_lock_timeout: Duration::from_secs(60),
            sticky_timeout: Duration::from_secs(30),
        }
    }
}

/// How much context a leased workflow task ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Full history plus new events.
    New,
    /// Only the last history event; the worker still holds the in-memory
    /// state from the previous task of this instance.
    Continuation,
}

/// A leased unit of workflow progress.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub instance: WorkflowInstance,
    pub history: Vec<Event>,
    pub new_events: Vec<Event>,
    pub kind: TaskKind,
}

/// A leased activity invocation. `event` is the `ActivityScheduled` event
/// that requested it.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub id: String,
    pub instance: WorkflowInstance,
    pub event: Event,
}

/// Transactional storage contract.
///
/// One backend value represents one worker's connection; the backend carries
/// the worker identity used for lease ownership checks.
#[async_trait]
pub trait Backend: Send + Sync {
    fn options(&self) -> BackendOptions;

    /// Insert the instance row and its start event. Idempotent for the exact
    /// same `(instance_id, execution_id)`; any other conflict is
    /// `AlreadyExists`.
    async fn create_workflow_instance(&self, event: WorkflowEvent) -> Result<(), BackendError>;

    /// Queue a cancellation request for the instance and, recursively, for
    /// all of its uncompleted descendants.
    async fn cancel_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), BackendError>;

    /// Append a pending event for the instance.
    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError>;

    /// Atomically lease one instance that has deliverable pending events.
    /// Returns `None` when no work is available.
    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError>;

    /// Extend the caller's lease on the instance.
    async fn extend_workflow_task(&self, instance: &WorkflowInstance) -> Result<(), BackendError>;

    /// Commit one workflow task: delete `executed_events` from the pending
    /// set, append them to history, materialize activity tasks and child
    /// instances, insert `produced_events` as pending events on their target
    /// instances, release the lease, stamp stickiness and mark completion.
    async fn complete_workflow_task(
        &self,
        instance: &WorkflowInstance,
        executed_events: Vec<Event>,
        produced_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError>;

    /// Atomically lease one activity task. Returns `None` when no work is
    /// available.
    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError>;

    async fn extend_activity_task(&self, activity_id: &str) -> Result<(), BackendError>;

    /// Delete the activity row and append `result_event` to the parent
    /// instance's pending events, atomically.
    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        activity_id: &str,
        result_event: Event,
    ) -> Result<(), BackendError>;

    /// The instance's history so far. Read-only; used by clients waiting for
    /// results and by tests.
    async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, BackendError>;
}
