//! Workflow channels.
//!
//! Channels connect workflow code to signal delivery and to cancellation.
//! They are owned by a single coroutine; the executor only touches them
//! through the non-blocking entry points while the coroutine is parked, so
//! the inner mutex is never contended.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::context::WorkflowContext;

type ReceiveCallback<T> = Box<dyn FnOnce(Option<T>) + Send>;
type SenderEntry<T> = Box<dyn FnOnce() -> T + Send>;

struct ChannelState<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    receivers: VecDeque<ReceiveCallback<T>>,
    senders: VecDeque<SenderEntry<T>>,
    closed: bool,
}

/// Unbuffered or buffered channel. `send` and `receive` yield the coroutine;
/// parked senders and receivers are served in FIFO order.
pub struct Channel<T> {
    inner: Arc<Mutex<ChannelState<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Unbuffered channel: every send rendezvouses with a receive.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                capacity,
                receivers: VecDeque::new(),
                senders: VecDeque::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `v`, yielding until a receiver takes it if the channel has no
    /// free capacity. Panics on a closed channel.
    pub fn send(&self, ctx: &WorkflowContext, v: T) {
        let co = ctx.yielder();
        let mut v = Some(v);

        let sent = {
            let mut st = self.lock();
            if st.closed {
                drop(st);
                panic!("send on closed channel");
            }
            if let Some(cb) = st.receivers.pop_front() {
                drop(st);
                cb(Some(v.take().expect("send value present")));
                co.made_progress();
                return;
            }
            if st.buffer.len() < st.capacity {
                st.buffer.push_back(v.take().expect("send value present"));
                co.made_progress();
                return;
            }
            // Park as a sender; a receiver will pull the value out through
            // the callback.
            let cell = Arc::new(Mutex::new(v.take()));
            let sent = Arc::new(AtomicBool::new(false));
            let cell2 = cell.clone();
            let sent2 = sent.clone();
            st.senders.push_back(Box::new(move || {
                sent2.store(true, Ordering::SeqCst);
                cell2.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .expect("parked send value taken once")
            }));
            sent
        };

        loop {
            co.yield_now();
            if sent.load(Ordering::SeqCst) {
                co.made_progress();
                return;
            }
        }
    }

    /// Deliver `v` only if that is possible without yielding.
    pub fn send_nonblocking(&self, v: T) -> bool {
        let mut st = self.lock();
        if st.closed {
            return false;
        }
        if let Some(cb) = st.receivers.pop_front() {
            drop(st);
            cb(Some(v));
            return true;
        }
        if st.buffer.len() < st.capacity {
            st.buffer.push_back(v);
            return true;
        }
        false
    }

    /// Receive a value, yielding until one is available. Returns `None` once
    /// the channel is closed and drained.
    pub fn receive(&self, ctx: &WorkflowContext) -> Option<T> {
        let co = ctx.yielder();
        if let Some(got) = self.try_receive() {
            co.made_progress();
            return got;
        }

        let slot: Arc<Mutex<Option<Option<T>>>> = Arc::new(Mutex::new(None));
        {
            let slot2 = slot.clone();
            let mut st = self.lock();
            st.receivers.push_back(Box::new(move |v| {
                *slot2.lock().unwrap_or_else(|e| e.into_inner()) = Some(v);
            }));
        }

        loop {
            co.yield_now();
            let delivered = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(v) = delivered {
                co.made_progress();
                return v;
            }
        }
    }

    /// Receive without yielding. Outer `None` means nothing was available;
    /// `Some(None)` means the channel is closed and drained.
    pub fn receive_nonblocking(&self) -> Option<Option<T>> {
        self.try_receive()
    }

    fn try_receive(&self) -> Option<Option<T>> {
        let mut st = self.lock();
        if let Some(v) = st.buffer.pop_front() {
            return Some(Some(v));
        }
        if st.closed {
            return Some(None);
        }
        if let Some(sender) = st.senders.pop_front() {
            drop(st);
            return Some(Some(sender()));
        }
        None
    }

    /// Close the channel and unblock all parked receivers with `None`.
    /// Panics if senders are parked.
    pub fn close(&self) {
        let receivers = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            if !st.senders.is_empty() {
                drop(st);
                panic!("close of channel with parked senders");
            }
            std::mem::take(&mut st.receivers)
        };
        for cb in receivers {
            cb(None);
        }
    }

    pub fn closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether a `receive` would return without yielding.
    pub fn can_receive(&self) -> bool {
        let st = self.lock();
        !st.buffer.is_empty() || !st.senders.is_empty() || st.closed
    }

    /// Run `cb` with a value as soon as one is receivable: immediately if the
    /// channel is already receivable, otherwise when a value (or close)
    /// arrives. Returns whether `cb` ran immediately.
    pub(crate) fn notify_receivable(&self, cb: ReceiveCallback<T>) -> bool {
        // Racing a concurrent close is not a concern: callers run on the
        // coroutine while the executor is blocked in resume.
        if let Some(v) = self.try_receive() {
            cb(v);
            true
        } else {
            self.lock().receivers.push_back(cb);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_send_receive_fifo() {
        let ch = Channel::<i32>::with_capacity(2);
        assert!(ch.send_nonblocking(1));
        assert!(ch.send_nonblocking(2));
        assert!(!ch.send_nonblocking(3));
        assert_eq!(ch.receive_nonblocking(), Some(Some(1)));
        assert_eq!(ch.receive_nonblocking(), Some(Some(2)));
        assert_eq!(ch.receive_nonblocking(), None);
    }

    #[test]
    fn unbuffered_nonblocking_send_fails_without_receiver() {
        let ch = Channel::<i32>::new();
        assert!(!ch.send_nonblocking(1));
        assert!(!ch.can_receive());
    }

    #[test]
    fn closed_channel_reports_drained() {
        let ch = Channel::<i32>::with_capacity(1);
        ch.send_nonblocking(7);
        ch.close();
        assert!(ch.closed());
        assert!(ch.can_receive());
        assert_eq!(ch.receive_nonblocking(), Some(Some(7)));
        assert_eq!(ch.receive_nonblocking(), Some(None));
        assert!(!ch.send_nonblocking(8));
    }

    #[test]
    fn close_is_idempotent() {
        let ch = Channel::<i32>::new();
        ch.close();
        ch.close();
        assert!(ch.closed());
    }

    #[test]
    fn notify_receivable_fires_on_close() {
        let ch = Channel::<()>::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let immediate = ch.notify_receivable(Box::new(move |v| {
            assert!(v.is_none());
            f.store(true, Ordering::SeqCst);
        }));
        assert!(!immediate);
        assert!(!fired.load(Ordering::SeqCst));
        ch.close();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn notify_receivable_fires_immediately_when_closed() {
        let ch = Channel::<()>::new();
        ch.close();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        assert!(ch.notify_receivable(Box::new(move |_| f.store(true, Ordering::SeqCst))));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn receiver_callbacks_are_fifo() {
        let ch = Channel::<i32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in [1, 2] {
            let order2 = order.clone();
            ch.notify_receivable(Box::new(move |v| {
                order2.lock().unwrap().push((tag, v));
            }));
        }
        assert!(ch.send_nonblocking(10));
        assert!(ch.send_nonblocking(20));
        let got = order.lock().unwrap().clone();
        assert_eq!(got, vec![(1, Some(10)), (2, Some(20))]);
    }
}
