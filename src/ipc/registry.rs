//! Correlation of asynchronous responses to their pending callers.
//!
//! Every registered request owns a deadline timer. Whichever of response,
//! deadline, or fail-all reaches the map first removes the entry; the loser
//! finds nothing and does nothing. Removal is the only way to get at the
//! completion sender, so an entry can never be settled twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ipc::error::IpcError;

/// Outcome delivered to a waiting caller.
pub type Outcome = Result<Value, IpcError>;

struct PendingRequest {
    tx: oneshot::Sender<Outcome>,
    deadline: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, outcome: Outcome) {
        self.deadline.abort();
        // Receiver gone means the caller was abandoned; nothing to deliver.
        let _ = self.tx.send(outcome);
    }
}

type PendingMap = HashMap<String, PendingRequest>;

/// Map of in-flight requests keyed by correlation id.
///
/// Cloning is cheap and all clones share the same map.
#[derive(Clone)]
pub struct Registry {
    pending: Arc<Mutex<PendingMap>>,
    timeout: Duration,
    max_in_flight: usize,
}

impl Registry {
    pub fn new(timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Number of requests waiting for a response.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Register a pending request and arm its deadline.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Outcome>, IpcError> {
        self.register_with_timeout(id, self.timeout)
    }

    /// Register with a deadline other than the registry default, e.g. the
    /// part of a caller's budget left after waiting for readiness.
    pub fn register_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, IpcError> {
        let mut entries = self.entries();

        if entries.len() >= self.max_in_flight {
            return Err(IpcError::Overloaded(self.max_in_flight));
        }
        if entries.contains_key(id) {
            return Err(IpcError::Protocol(format!("Duplicate correlation id {}", id)));
        }

        let (tx, rx) = oneshot::channel();
        let deadline = tokio::spawn(expire(
            Arc::clone(&self.pending),
            id.to_string(),
            timeout,
        ));
        entries.insert(id.to_string(), PendingRequest { tx, deadline });

        Ok(rx)
    }

    /// Settle a pending request with the worker's answer.
    ///
    /// Returns false when the id is unknown (already timed out, or never
    /// registered); such responses are discarded.
    pub fn resolve(&self, id: &str, outcome: Outcome) -> bool {
        let entry = self.entries().remove(id);
        match entry {
            Some(pending) => {
                pending.settle(outcome);
                true
            }
            None => {
                debug!("Discarding response for unknown request {}", id);
                false
            }
        }
    }

    /// Drop a pending request without notifying its caller.
    pub fn cancel(&self, id: &str) -> bool {
        let entry = self.entries().remove(id);
        match entry {
            Some(pending) => {
                pending.deadline.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every pending request. Returns how many were failed.
    pub fn fail_all(&self, make_error: impl Fn() -> IpcError) -> usize {
        let drained: Vec<_> = self.entries().drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            pending.settle(Err(make_error()));
        }
        count
    }

    fn entries(&self) -> MutexGuard<'_, PendingMap> {
        lock(&self.pending)
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    // A panic while holding the lock cannot leave the map half-updated.
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn expire(pending: Arc<Mutex<PendingMap>>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let entry = lock(&pending).remove(&id);
    if let Some(entry) = entry {
        warn!("Request {} timed out after {:?}", id, timeout);
        // The deadline task is the one running; just deliver.
        let _ = entry.tx.send(Err(IpcError::Timeout(timeout)));
    }
}
