//! Cooperative coroutine on a dedicated OS thread.
//!
//! A workflow function runs on its own thread, paired with the executor
//! through two rendezvous channels. Exactly one of {executor, workflow} is
//! runnable at any instant: `resume` hands control to the workflow and blocks
//! until it yields or returns; `yield_now` does the reverse. The thread is
//! spawned parked, so no workflow code runs outside a `resume` window.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

/// Unwind payload used to terminate a parked workflow thread whose executor
/// has gone away. Must never be converted into a workflow failure.
pub(crate) struct Detached;

#[derive(Default)]
struct CoShared {
    done: AtomicBool,
    progress: AtomicBool,
}

/// Executor-side handle. Dropping it wakes a parked coroutine, which then
/// unwinds with [`Detached`] and exits its thread.
pub(crate) struct Coroutine {
    unblock_tx: SyncSender<()>,
    blocking_rx: Receiver<()>,
    shared: Arc<CoShared>,
}

/// Workflow-side handle, reachable through the [`crate::WorkflowContext`].
pub(crate) struct Yielder {
    blocking_tx: SyncSender<()>,
    unblock_rx: Mutex<Receiver<()>>,
    shared: Arc<CoShared>,
}

impl Coroutine {
    /// Spawn a parked coroutine. `f` receives the workflow-side handle and
    /// only starts running inside the first `resume`.
    pub fn spawn<F>(f: F) -> Coroutine
    where
        F: FnOnce(Arc<Yielder>) + Send + 'static,
    {
        let (blocking_tx, blocking_rx) = sync_channel::<()>(1);
        let (unblock_tx, unblock_rx) = sync_channel::<()>(0);
        let shared = Arc::new(CoShared::default());

        let inner = Arc::new(Yielder {
            blocking_tx,
            unblock_rx: Mutex::new(unblock_rx),
            shared: shared.clone(),
        });
        // The join handle is dropped: thread shutdown is driven through the
        // channels, not through join.
        thread::Builder::new()
            .name("workflow-coroutine".to_string())
            .spawn(move || {
                // Park until the first resume. A closed channel means the
                // executor was dropped before ever running us.
                if inner.wait_for_resume().is_err() {
                    return;
                }
                let body_yielder = inner.clone();
                let result = catch_unwind(AssertUnwindSafe(move || f(body_yielder)));
                inner.shared.done.store(true, Ordering::SeqCst);
                let _ = inner.blocking_tx.send(());
                if let Err(payload) = result {
                    if !payload.is::<Detached>() {
                        // The executor wrapper converts workflow panics into a
                        // failed result before they reach this frame.
                        resume_unwind(payload);
                    }
                }
            })
            .expect("spawn workflow coroutine thread");

        Coroutine {
            unblock_tx,
            blocking_rx,
            shared,
        }
    }

    /// Run the coroutine until its next yield or until it returns.
    pub fn resume(&self) {
        if self.finished() {
            return;
        }
        if self.unblock_tx.send(()).is_err() {
            return;
        }
        let _ = self.blocking_rx.recv();
    }

    pub fn finished(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Read and clear the progress flag set by primitives since the last call.
    pub fn take_progress(&self) -> bool {
        self.shared.progress.swap(false, Ordering::SeqCst)
    }
}

impl Yielder {
    fn wait_for_resume(&self) -> Result<(), RecvError> {
        let rx = self.unblock_rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.recv()
    }

    /// Park the coroutine until the next `resume`.
    pub fn yield_now(&self) {
        if self.blocking_tx.send(()).is_err() {
            // Executor gone while we were running; unwind out of the workflow.
            resume_unwind(Box::new(Detached));
        }
        if self.wait_for_resume().is_err() {
            resume_unwind(Box::new(Detached));
        }
    }

    /// Note that the workflow consumed new information this resume cycle. The
    /// executor stops pumping once a full cycle passes without progress.
    pub fn made_progress(&self) {
        self.shared.progress.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_is_parked_until_first_resume() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let co = Coroutine::spawn(move |_y| {
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
        co.resume();
        assert!(ran.load(Ordering::SeqCst));
        assert!(co.finished());
    }

    #[test]
    fn yield_and_resume_alternate() {
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let c = counter.clone();
        let co = Coroutine::spawn(move |y| {
            c.fetch_add(1, Ordering::SeqCst);
            y.yield_now();
            c.fetch_add(1, Ordering::SeqCst);
            y.yield_now();
            c.fetch_add(1, Ordering::SeqCst);
        });

        co.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!co.finished());
        co.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        co.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(co.finished());
        // Resuming a finished coroutine is a no-op.
        co.resume();
    }

    #[test]
    fn progress_flag_is_cleared_on_read() {
        let co = Coroutine::spawn(move |y| {
            y.made_progress();
            y.yield_now();
        });
        co.resume();
        assert!(co.take_progress());
        assert!(!co.take_progress());
    }

    #[test]
    fn dropping_handle_releases_parked_thread() {
        let co = Coroutine::spawn(move |y| loop {
            y.yield_now();
        });
        co.resume();
        drop(co);
        // The parked thread unwinds with Detached and exits; nothing to
        // observe here beyond not hanging.
    }
}
