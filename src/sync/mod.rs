//! Workflow-local synchronization primitives.
//!
//! Everything in this module runs on the workflow coroutine and suspends by
//! yielding it, never by blocking the host thread. The executor resumes the
//! coroutine whenever replayed or newly arrived events may have made
//! progress possible.

pub mod channel;
pub mod context;
pub mod coroutine;
pub mod future;
pub mod selector;

pub use channel::Channel;
pub use future::Future;
pub use selector::Selector;
