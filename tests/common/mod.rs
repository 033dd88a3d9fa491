#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use loomwork::backend::memory::InMemoryBackend;
use loomwork::backend::BackendOptions;
use loomwork::{Client, Event, Worker};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// In-memory backend, client and worker wired together. The worker loops are
/// stopped when the harness drops.
pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub client: Client,
    pub worker: Arc<Worker>,
    shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(BackendOptions::default())
    }

    pub fn with_options(options: BackendOptions) -> Self {
        let backend = Arc::new(InMemoryBackend::new(options));
        let client = Client::new(backend.clone());
        let worker = Arc::new(Worker::new(backend.clone()));
        Self {
            backend,
            client,
            worker,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the worker loops; call after registering workflows/activities.
    pub fn start(&self) {
        self.worker.clone().start(self.shutdown.clone());
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll the instance's history until `predicate` matches or the timeout
/// elapses.
#[allow(dead_code)]
pub async fn wait_for_history<F>(client: &Client, instance_id: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let history = client.read_history(instance_id).await.unwrap_or_default();
        if predicate(&history) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Event kind names in history order, for shape assertions.
#[allow(dead_code)]
pub fn kind_names(history: &[Event]) -> Vec<&'static str> {
    history.iter().map(|e| e.kind_name()).collect()
}
