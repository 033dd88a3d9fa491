//! Workflow and activity workers.
//!
//! A worker owns a registry and polls its backend on two loops. Workflow
//! tasks execute on the blocking pool because the replay executor parks the
//! calling thread while the coroutine runs; activities execute inline on the
//! async runtime. Both kinds of lease are kept alive by a heartbeat that
//! extends the lock at half its timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ActivityTask, Backend, WorkflowTask};
use crate::converter::{Converter, JsonConverter};
use crate::error::{FailureDetails, WorkflowError};
use crate::executor::{panic_message, ExecutorError, WorkflowExecutor};
use crate::history::{Event, EventKind};
use crate::registry::{fn_name, FnActivity, FnWorkflow, Registry};
use crate::sync::context::WorkflowContext;
use crate::{Payload, WorkflowInstance};

const IDLE_SLEEP: Duration = Duration::from_millis(10);
const BACKEND_RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Context handed to activity functions. Activities are leaf work units;
/// the context provides correlation metadata and trace helpers, not
/// scheduling.
#[derive(Clone)]
pub struct ActivityContext {
    instance: WorkflowInstance,
    activity_name: String,
    activity_id: String,
}

impl ActivityContext {
    pub(crate) fn new(instance: WorkflowInstance, activity_name: String, activity_id: String) -> Self {
        Self {
            instance,
            activity_name,
            activity_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn execution_id(&self) -> &str {
        &self.instance.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Diagnostic log line carrying the activity's correlation fields. Not
    /// part of replay.
    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "loomwork::activity",
            instance_id = %self.instance.instance_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "loomwork::activity",
            instance_id = %self.instance.instance_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            "{}",
            message.into()
        );
    }
}

/// Hosts workflow and activity execution against one backend.
pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    executor: Arc<WorkflowExecutor>,
    converter: Arc<dyn Converter>,
}

impl Worker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_converter(backend, Arc::new(JsonConverter))
    }

    pub fn with_converter(backend: Arc<dyn Backend>, converter: Arc<dyn Converter>) -> Self {
        let registry = Arc::new(Registry::new());
        let executor = Arc::new(WorkflowExecutor::new(registry.clone(), converter.clone()));
        Self {
            backend,
            registry,
            executor,
            converter,
        }
    }

    /// Register a workflow function under its own name.
    pub fn register_workflow<F, I, O>(&self, f: F)
    where
        F: Fn(WorkflowContext, I) -> Result<O, WorkflowError> + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.register_workflow_named(fn_name::<F>(), f);
    }

    /// Register a workflow under an explicit name. Needed for closures.
    pub fn register_workflow_named<F, I, O>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowContext, I) -> Result<O, WorkflowError> + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.registry
            .register_workflow_handler(name, Arc::new(FnWorkflow::new(f, self.converter.clone())));
    }

    /// Register an async activity function under its own name.
    pub fn register_activity<F, Fut, I, O>(&self, f: F)
    where
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, String>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.register_activity_named(fn_name::<F>(), f);
    }

    pub fn register_activity_named<F, Fut, I, O>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, String>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.registry
            .register_activity_handler(name, Arc::new(FnActivity::new(f, self.converter.clone())));
    }

    /// Spawn the workflow and activity poll loops. They run until `shutdown`
    /// is canceled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        crate::logging::init();
        let workflow_loop = tokio::spawn(self.clone().run_workflow_loop(shutdown.clone()));
        let activity_loop = tokio::spawn(self.clone().run_activity_loop(shutdown.clone()));
        tokio::spawn(async move {
            shutdown.cancelled().await;
            workflow_loop.abort();
            activity_loop.abort();
        })
    }

    async fn run_workflow_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.backend.get_workflow_task().await {
                Ok(Some(task)) => self.process_workflow_task(task).await,
                Ok(None) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    warn!(error = %e, "fetching workflow task failed");
                    tokio::time::sleep(BACKEND_RETRY_SLEEP).await;
                }
            }
        }
    }

    async fn process_workflow_task(&self, task: WorkflowTask) {
        let instance = task.instance.clone();
        let heartbeat = self.spawn_workflow_heartbeat(instance.clone());

        let executor = self.executor.clone();
        let execution = tokio::task::spawn_blocking(move || {
            let result = executor.execute(&task);
            (task, result)
        })
        .await;
        heartbeat.abort();

        let (task, result) = match execution {
            Ok(r) => r,
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "workflow task execution aborted");
                return;
            }
        };

        match result {
            Ok((output, run)) => {
                let completed = output.completed;
                match self
                    .backend
                    .complete_workflow_task(&instance, output.executed_events, output.produced_events)
                    .await
                {
                    Ok(()) => {
                        if completed {
                            drop(run);
                        } else {
                            self.executor.retain(run);
                        }
                    }
                    Err(e) => {
                        // Commit rolled back as a whole; another worker will
                        // redo the task from history.
                        warn!(instance_id = %instance.instance_id, error = %e, "workflow task commit failed");
                        drop(run);
                    }
                }
            }
            Err(ExecutorError::MissingCache) => {
                debug!(
                    instance_id = %task.instance.instance_id,
                    "refusing continuation without cached state, lease will expire"
                );
            }
            Err(e) => {
                warn!(
                    instance_id = %task.instance.instance_id,
                    error = %e,
                    "workflow task failed, lease will expire"
                );
                self.executor.evict(&task.instance.instance_id);
            }
        }
    }

    fn spawn_workflow_heartbeat(&self, instance: WorkflowInstance) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let interval = self.backend.options().workflow_lock_timeout / 2;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = backend.extend_workflow_task(&instance).await {
                    debug!(instance_id = %instance.instance_id, error = %e, "workflow lease extension failed");
                    return;
                }
            }
        })
    }

    async fn run_activity_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.backend.get_activity_task().await {
                Ok(Some(task)) => self.process_activity_task(task).await,
                Ok(None) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    warn!(error = %e, "fetching activity task failed");
                    tokio::time::sleep(BACKEND_RETRY_SLEEP).await;
                }
            }
        }
    }

    async fn process_activity_task(&self, task: ActivityTask) {
        let ActivityTask { id, instance, event } = task;
        let (name, inputs) = match &event.kind {
            EventKind::ActivityScheduled { name, inputs } => (name.clone(), inputs.clone()),
            other => {
                warn!(activity_id = %id, kind = ?other, "activity task without a schedule event, dropping");
                return;
            }
        };
        let schedule_event_id = event.schedule_event_id;
        let heartbeat = self.spawn_activity_heartbeat(id.clone());

        let outcome: Result<Payload, FailureDetails> = match self.registry.activity(&name) {
            None => {
                debug!(activity_name = %name, "activity not registered");
                Err(FailureDetails::error(format!("activity not registered: {name}")))
            }
            Some(handler) => {
                let ctx = ActivityContext::new(instance.clone(), name.clone(), id.clone());
                match std::panic::AssertUnwindSafe(handler.invoke(ctx, inputs))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(message)) => Err(FailureDetails::error(message)),
                    Err(payload) => Err(FailureDetails::error(panic_message(payload))),
                }
            }
        };
        heartbeat.abort();

        let result_event = match outcome {
            Ok(result) => Event::new(EventKind::ActivityCompleted { result }),
            Err(details) => Event::new(EventKind::ActivityFailed { details }),
        }
        .with_schedule_event_id(schedule_event_id);

        if let Err(e) = self.backend.complete_activity_task(&instance, &id, result_event).await {
            warn!(instance_id = %instance.instance_id, activity_id = %id, error = %e, "activity completion failed");
        }
    }

    fn spawn_activity_heartbeat(&self, activity_id: String) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let interval = self.backend.options().activity_lock_timeout / 2;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = backend.extend_activity_task(&activity_id).await {
                    debug!(activity_id = %activity_id, error = %e, "activity lease extension failed");
                    return;
                }
            }
        })
    }
}
