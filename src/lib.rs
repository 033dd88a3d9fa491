//! # Loomwork: durable workflow engine
//!
//! Loomwork runs long-lived workflow functions so that their progress survives
//! process restarts and crashes. Every externally visible decision a workflow
//! makes is recorded as an event in an append-only per-instance history; the
//! in-memory state of a workflow is rebuilt at any time by deterministically
//! replaying that history from the beginning.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use loomwork::backend::memory::InMemoryBackend;
//! use loomwork::{ActivityContext, Client, Worker, WorkflowContext, WorkflowError};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn add(_ctx: ActivityContext, input: (i64, i64)) -> Result<i64, String> {
//!     Ok(input.0 + input.1)
//! }
//!
//! fn adder(ctx: WorkflowContext, input: (i64, i64)) -> Result<i64, WorkflowError> {
//!     ctx.execute_activity(Default::default(), add, input).get(&ctx)
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(InMemoryBackend::new(Default::default()));
//!
//! let worker = Arc::new(Worker::new(backend.clone()));
//! worker.register_workflow(adder);
//! worker.register_activity(add);
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! worker.clone().start(shutdown.clone());
//!
//! let client = Client::new(backend.clone());
//! let instance = client
//!     .create_workflow_instance(
//!         loomwork::WorkflowInstanceOptions::with_instance_id("add-1"),
//!         adder,
//!         (3i64, 4i64),
//!     )
//!     .await?;
//! let sum: i64 = client.wait_for_result(&instance.instance_id, Duration::from_secs(5)).await?;
//! assert_eq!(sum, 7);
//! shutdown.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! ## Key concepts
//!
//! - **Workflows** are plain functions of `(WorkflowContext, In) -> Result<Out, WorkflowError>`.
//!   They run on a dedicated cooperative coroutine and must route every source
//!   of non-determinism (time, randomness, I/O) through an activity, a timer,
//!   or a side effect.
//! - **Activities** are async functions executed on separate workers. Their
//!   only interaction with a workflow is the scheduled-event/completion-event
//!   pair recorded in history.
//! - **Signals** deliver external data to a running instance by name;
//!   workflows receive them over [`sync::Channel`]s.
//! - **Backends** persist history, pending events, activity tasks and leases.
//!   [`backend::memory::InMemoryBackend`] is for tests and development,
//!   [`backend::sqlite::SqliteBackend`] is the durable variant.
//!
//! ## Execution model
//!
//! ```text
//! Client ──start/signal/cancel──▶ Backend (instances, pending_events,
//!                                          history, activities)
//!                                    ▲│ lease / commit
//!                                    │▼
//! Worker ──▶ workflow poll loop ──▶ Executor ──▶ coroutine (workflow fn)
//!        └─▶ activity poll loop ──▶ user activity fn
//! ```
//!
//! A workflow task delivers the instance's history plus newly pending events.
//! The executor replays history into a fresh coroutine, folds the new events
//! in, and harvests the commands the workflow produced. Committing a task
//! atomically moves the consumed events into history, materializes scheduled
//! activities, timers and sub-workflows, and releases the lease.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod client;
pub mod command;
pub mod converter;
pub mod error;
pub mod executor;
pub mod history;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod sync;
pub mod worker;

mod state;

pub use client::{Client, ClientError, WorkflowInstanceOptions};
pub use converter::{Converter, JsonConverter};
pub use error::{FailureDetails, FailureKind, WorkflowError};
pub use history::{Event, EventKind, WorkflowEvent};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use sync::context::{ActivityOptions, SubWorkflowOptions, WorkflowContext};
pub use worker::{ActivityContext, Worker};

/// Opaque serialized argument or result payload. The codec that produced a
/// payload must be used to read it back; see [`converter::Converter`].
pub type Payload = Vec<u8>;

/// Identity of one workflow execution.
///
/// `instance_id` is caller-supplied and stable. `execution_id` is a fresh
/// random token per run, so two executions under the same instance id are
/// distinct. Sub-workflows additionally carry the parent instance id and the
/// schedule event id that created them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_schedule_event_id: Option<u64>,
}

impl WorkflowInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent_instance_id: None,
            parent_schedule_event_id: None,
        }
    }

    pub fn new_sub_workflow(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        parent_instance_id: impl Into<String>,
        parent_schedule_event_id: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent_instance_id: Some(parent_instance_id.into()),
            parent_schedule_event_id: Some(parent_schedule_event_id),
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        self.parent_instance_id.is_some()
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process-unique identifier, timestamp-prefixed so that lexicographic order
/// of ids generated by one process matches generation order.
pub(crate) fn new_guid() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:012x}-{:08x}", now_ms(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guids_are_unique_and_ordered() {
        let a = new_guid();
        let b = new_guid();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn sub_workflow_instance_carries_parent() {
        let wfi = WorkflowInstance::new_sub_workflow("child", "e1", "parent", 3);
        assert!(wfi.is_sub_workflow());
        assert_eq!(wfi.parent_instance_id.as_deref(), Some("parent"));
        assert_eq!(wfi.parent_schedule_event_id, Some(3));
    }
}
