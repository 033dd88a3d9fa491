//! Deterministic select over futures and channels.
//!
//! Cases are checked in the order they were added, once per resume cycle, and
//! the first ready case wins. A default case is always ready, so it fires
//! whenever the cases before it are not. The fixed check order makes replay
//! reproduce the same choice.

use crate::error::WorkflowError;
use crate::sync::channel::Channel;
use crate::sync::context::WorkflowContext;
use crate::sync::future::Future;

trait SelectCase<R> {
    fn ready(&self) -> bool;
    fn run(self: Box<Self>, ctx: &WorkflowContext) -> R;
}

struct FutureCase<T, R, F> {
    fut: Future<T>,
    handler: F,
    _marker: std::marker::PhantomData<fn() -> (T, R)>,
}

impl<T, R, F> SelectCase<R> for FutureCase<T, R, F>
where
    T: Clone + Send + 'static,
    F: FnOnce(&WorkflowContext, Result<T, WorkflowError>) -> R,
{
    fn ready(&self) -> bool {
        self.fut.ready()
    }

    fn run(self: Box<Self>, ctx: &WorkflowContext) -> R {
        let result = self.fut.get(ctx);
        (self.handler)(ctx, result)
    }
}

struct ReceiveCase<T, R, F> {
    channel: Channel<T>,
    handler: F,
    _marker: std::marker::PhantomData<fn() -> (T, R)>,
}

impl<T, R, F> SelectCase<R> for ReceiveCase<T, R, F>
where
    T: Send + 'static,
    F: FnOnce(&WorkflowContext, Option<T>) -> R,
{
    fn ready(&self) -> bool {
        self.channel.can_receive()
    }

    fn run(self: Box<Self>, ctx: &WorkflowContext) -> R {
        let v = self.channel.receive(ctx);
        (self.handler)(ctx, v)
    }
}

struct DefaultCase<R, F> {
    handler: F,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R, F> SelectCase<R> for DefaultCase<R, F>
where
    F: FnOnce(&WorkflowContext) -> R,
{
    fn ready(&self) -> bool {
        true
    }

    fn run(self: Box<Self>, ctx: &WorkflowContext) -> R {
        (self.handler)(ctx)
    }
}

/// Builder for a select statement; all handlers produce the same `R`.
pub struct Selector<'a, R> {
    cases: Vec<Box<dyn SelectCase<R> + 'a>>,
}

impl<'a, R: 'a> Default for Selector<'a, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R: 'a> Selector<'a, R> {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Fire when `fut` resolves.
    pub fn future<T, F>(mut self, fut: Future<T>, handler: F) -> Self
    where
        T: Clone + Send + 'static,
        F: FnOnce(&WorkflowContext, Result<T, WorkflowError>) -> R + 'a,
    {
        self.cases.push(Box::new(FutureCase {
            fut,
            handler,
            _marker: std::marker::PhantomData,
        }));
        self
    }

    /// Fire when `channel` is receivable.
    pub fn receive<T, F>(mut self, channel: Channel<T>, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(&WorkflowContext, Option<T>) -> R + 'a,
    {
        self.cases.push(Box::new(ReceiveCase {
            channel,
            handler,
            _marker: std::marker::PhantomData,
        }));
        self
    }

    /// Fire when no case listed before it is ready. List it last.
    pub fn default_case<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&WorkflowContext) -> R + 'a,
    {
        self.cases.push(Box::new(DefaultCase {
            handler,
            _marker: std::marker::PhantomData,
        }));
        self
    }

    /// Block until one case fires and return its handler's result.
    pub fn select(mut self, ctx: &WorkflowContext) -> R {
        let co = ctx.yielder();
        loop {
            if let Some(idx) = self.cases.iter().position(|c| c.ready()) {
                let case = self.cases.remove(idx);
                return case.run(ctx);
            }
            co.yield_now();
        }
    }
}
