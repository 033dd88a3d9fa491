//! Client surface: start, signal and cancel workflow instances.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::backend::{Backend, BackendError};
use crate::converter::{self, Converter, JsonConverter};
use crate::error::FailureDetails;
use crate::history::{Event, EventKind, WorkflowEvent};
use crate::registry::fn_name;
use crate::{new_guid, WorkflowInstance};

/// Options for [`Client::create_workflow_instance`].
#[derive(Debug, Clone)]
pub struct WorkflowInstanceOptions {
    pub instance_id: String,
}

impl WorkflowInstanceOptions {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Backend(BackendError),
    Serialization(String),
    /// The workflow finished with an error.
    WorkflowFailed(FailureDetails),
    Timeout,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Backend(e) => write!(f, "backend error: {e}"),
            ClientError::Serialization(e) => write!(f, "serialization failed: {e}"),
            ClientError::WorkflowFailed(d) => write!(f, "workflow failed: {d}"),
            ClientError::Timeout => write!(f, "timed out waiting for workflow"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<BackendError> for ClientError {
    fn from(e: BackendError) -> Self {
        ClientError::Backend(e)
    }
}

/// Starts, signals and cancels workflow instances through a backend.
pub struct Client {
    backend: Arc<dyn Backend>,
    converter: Arc<dyn Converter>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_converter(backend, Arc::new(JsonConverter))
    }

    pub fn with_converter(backend: Arc<dyn Backend>, converter: Arc<dyn Converter>) -> Self {
        Self { backend, converter }
    }

    /// Start a new instance of `workflow` with a fresh execution id. The
    /// workflow name is derived from the function's type path.
    pub async fn create_workflow_instance<F, I>(
        &self,
        options: WorkflowInstanceOptions,
        _workflow: F,
        input: I,
    ) -> Result<WorkflowInstance, ClientError>
    where
        I: Serialize,
    {
        self.create_workflow_instance_named(options, &fn_name::<F>(), input).await
    }

    /// Start a new instance of the workflow registered under `name`.
    pub async fn create_workflow_instance_named<I>(
        &self,
        options: WorkflowInstanceOptions,
        name: &str,
        input: I,
    ) -> Result<WorkflowInstance, ClientError>
    where
        I: Serialize,
    {
        let inputs = converter::encode(&*self.converter, &input).map_err(ClientError::Serialization)?;
        let instance = WorkflowInstance::new(options.instance_id, new_guid());
        let event = Event::new(EventKind::WorkflowExecutionStarted {
            name: name.to_string(),
            inputs,
        });
        self.backend
            .create_workflow_instance(WorkflowEvent {
                instance: instance.clone(),
                event,
            })
            .await?;
        Ok(instance)
    }

    /// Request cancellation of the instance and all of its uncompleted
    /// descendants. Asynchronous: the workflow observes it through its
    /// context's done channel.
    pub async fn cancel_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), ClientError> {
        self.backend.cancel_workflow_instance(instance).await?;
        Ok(())
    }

    /// Deliver a named signal to the instance.
    pub async fn signal_workflow<T: Serialize>(
        &self,
        instance_id: &str,
        name: &str,
        arg: T,
    ) -> Result<(), ClientError> {
        let arg = converter::encode(&*self.converter, &arg).map_err(ClientError::Serialization)?;
        let event = Event::new(EventKind::SignalReceived {
            name: name.to_string(),
            arg,
        });
        self.backend.signal_workflow(instance_id, event).await?;
        Ok(())
    }

    /// Poll the instance's history until it finishes and decode the result.
    pub async fn wait_for_result<T: DeserializeOwned>(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let history = self.backend.read_history(instance_id).await?;
            for event in history.iter().rev() {
                if let EventKind::WorkflowExecutionFinished { result, error } = &event.kind {
                    if let Some(details) = error {
                        return Err(ClientError::WorkflowFailed(details.clone()));
                    }
                    let payload = result.clone().unwrap_or_default();
                    return converter::decode(&*self.converter, &payload).map_err(ClientError::Serialization);
                }
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// The instance's history so far.
    pub async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.backend.read_history(instance_id).await?)
    }
}
