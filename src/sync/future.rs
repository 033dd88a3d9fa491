//! Single-shot workflow futures.

use std::sync::{Arc, Mutex};

use crate::error::WorkflowError;
use crate::retry::RetryPolicy;
use crate::sync::context::WorkflowContext;

type Cell<T> = Arc<Mutex<Option<Result<T, WorkflowError>>>>;

/// Deterministically re-schedules failed attempts from inside `get`.
struct RetryState<T> {
    policy: RetryPolicy,
    schedule: Box<dyn Fn(&WorkflowContext, u32) -> Future<T> + Send + Sync>,
    current: Mutex<(u32, Future<T>)>,
}

enum Inner<T> {
    Cell(Cell<T>),
    Retry(Arc<RetryState<T>>),
}

/// Result of a scheduled operation inside a workflow.
///
/// `get` returns immediately once the value is set and otherwise yields the
/// coroutine until it is. Futures are resolved by the executor when the
/// matching completion event is folded in, or directly by cancellation.
pub struct Future<T> {
    inner: Inner<T>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Inner::Cell(c) => Inner::Cell(c.clone()),
            Inner::Retry(r) => Inner::Retry(r.clone()),
        };
        Self { inner }
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    pub fn new() -> Self {
        Self {
            inner: Inner::Cell(Arc::new(Mutex::new(None))),
        }
    }

    /// Wrap `first` so that retryable failures re-schedule through
    /// `schedule(ctx, attempt)` with backoff, up to the policy's attempt
    /// budget. Retrying happens lazily, inside `get`.
    pub(crate) fn with_retry(
        policy: RetryPolicy,
        first: Future<T>,
        schedule: Box<dyn Fn(&WorkflowContext, u32) -> Future<T> + Send + Sync>,
    ) -> Self {
        Self {
            inner: Inner::Retry(Arc::new(RetryState {
                policy,
                schedule,
                current: Mutex::new((1, first)),
            })),
        }
    }

    /// Resolve the future. Panics if it was already resolved.
    pub fn set(&self, result: Result<T, WorkflowError>) {
        match &self.inner {
            Inner::Cell(cell) => {
                let mut guard = cell.lock().unwrap_or_else(|e| e.into_inner());
                if guard.is_some() {
                    drop(guard);
                    panic!("future already set");
                }
                *guard = Some(result);
            }
            Inner::Retry(_) => panic!("cannot set a retrying future"),
        }
    }

    /// Non-blocking readiness probe.
    pub fn ready(&self) -> bool {
        match &self.inner {
            Inner::Cell(cell) => cell.lock().unwrap_or_else(|e| e.into_inner()).is_some(),
            Inner::Retry(retry) => {
                let current = retry.current.lock().unwrap_or_else(|e| e.into_inner());
                current.1.ready()
            }
        }
    }

    pub(crate) fn try_get(&self) -> Option<Result<T, WorkflowError>> {
        match &self.inner {
            Inner::Cell(cell) => cell.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            Inner::Retry(retry) => {
                let current = retry.current.lock().unwrap_or_else(|e| e.into_inner());
                current.1.try_get()
            }
        }
    }

    /// Wait for the result, yielding the coroutine while unresolved.
    pub fn get(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        match &self.inner {
            Inner::Cell(_) => self.get_cell(ctx),
            Inner::Retry(retry) => Self::get_with_retries(retry, ctx),
        }
    }

    fn get_cell(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        let co = ctx.yielder();
        loop {
            if let Some(result) = self.try_get() {
                co.made_progress();
                return result;
            }
            co.yield_now();
        }
    }

    fn get_with_retries(retry: &Arc<RetryState<T>>, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        loop {
            let (attempt, fut) = {
                let current = retry.current.lock().unwrap_or_else(|e| e.into_inner());
                (current.0, current.1.clone())
            };
            match fut.get(ctx) {
                Ok(v) => return Ok(v),
                Err(WorkflowError::Canceled) => return Err(WorkflowError::Canceled),
                Err(err) => {
                    if attempt >= retry.policy.max_attempts {
                        return Err(err);
                    }
                    let delay = retry.policy.delay_for_attempt(attempt);
                    if !delay.is_zero() {
                        ctx.schedule_timer(delay).get(ctx)?;
                    }
                    let next = (retry.schedule)(ctx, attempt + 1);
                    let mut current = retry.current.lock().unwrap_or_else(|e| e.into_inner());
                    *current = (attempt + 1, next);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_try_get() {
        let f = Future::<i32>::new();
        assert!(!f.ready());
        f.set(Ok(5));
        assert!(f.ready());
        assert_eq!(f.try_get(), Some(Ok(5)));
        // A resolved future stays readable.
        assert_eq!(f.try_get(), Some(Ok(5)));
    }

    #[test]
    #[should_panic(expected = "future already set")]
    fn double_set_panics() {
        let f = Future::<i32>::new();
        f.set(Ok(1));
        f.set(Ok(2));
    }

    #[test]
    fn clones_share_the_cell() {
        let f = Future::<String>::new();
        let g = f.clone();
        f.set(Err(WorkflowError::Canceled));
        assert_eq!(g.try_get(), Some(Err(WorkflowError::Canceled)));
    }
}
