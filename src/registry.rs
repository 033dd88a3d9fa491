//! Name to handler maps for workflows and activities.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::converter::{self, Converter};
use crate::error::WorkflowError;
use crate::sync::context::WorkflowContext;
use crate::worker::ActivityContext;
use crate::Payload;

/// Registered workflow entry point. Runs on the workflow coroutine.
pub trait WorkflowHandler: Send + Sync {
    fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError>;
}

/// Registered activity entry point. Runs on the activity worker.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, String>;
}

/// Typed workflow function adapter: decodes the input, runs `f`, encodes the
/// output.
pub struct FnWorkflow<F, I, O> {
    f: F,
    converter: Arc<dyn Converter>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnWorkflow<F, I, O> {
    pub fn new(f: F, converter: Arc<dyn Converter>) -> Self {
        Self {
            f,
            converter,
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> WorkflowHandler for FnWorkflow<F, I, O>
where
    F: Fn(WorkflowContext, I) -> Result<O, WorkflowError> + Send + Sync,
    I: DeserializeOwned + Send,
    O: Serialize + Send,
{
    fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError> {
        let input: I = converter::decode(&*self.converter, &input).map_err(WorkflowError::serialization)?;
        let out = (self.f)(ctx, input)?;
        converter::encode(&*self.converter, &out).map_err(WorkflowError::serialization)
    }
}

/// Typed activity function adapter.
pub struct FnActivity<F, Fut, I, O> {
    f: F,
    converter: Arc<dyn Converter>,
    _marker: PhantomData<fn(I, Fut) -> O>,
}

impl<F, Fut, I, O> FnActivity<F, Fut, I, O> {
    pub fn new(f: F, converter: Arc<dyn Converter>) -> Self {
        Self {
            f,
            converter,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, I, O> ActivityHandler for FnActivity<F, Fut, I, O>
where
    F: Fn(ActivityContext, I) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<O, String>> + Send,
    I: DeserializeOwned + Send,
    O: Serialize + Send,
{
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, String> {
        let input: I = converter::decode(&*self.converter, &input)?;
        let out = (self.f)(ctx, input).await?;
        converter::encode(&*self.converter, &out)
    }
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, Arc<dyn WorkflowHandler>>,
    activities: HashMap<String, Arc<dyn ActivityHandler>>,
}

/// Shared registry, read-mostly and guarded by a single lock.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow_handler(&self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        self.lock().workflows.insert(name.into(), handler);
    }

    pub fn register_activity_handler(&self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) {
        self.lock().activities.insert(name.into(), handler);
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.lock().workflows.get(name).cloned()
    }

    pub fn activity(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.lock().activities.get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Name of a function item type: the last path segment, with generic
/// arguments stripped. Closures have no usable name; register those under an
/// explicit name instead.
pub(crate) fn fn_name<F>() -> String {
    let full = std::any::type_name::<F>();
    let base = full.rsplit("::").next().unwrap_or(full);
    let base = base.split('<').next().unwrap_or(base);
    base.to_string()
}
