//! RPC client for the supervised worker.
//!
//! `RpcClient` is the only surface domain code calls. Each `invoke` gets a
//! fresh UUID correlation id, is registered before being written, and
//! settles through the registry: with the worker's answer, the worker's
//! error, or a timeout.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ipc::envelope::encode_request;
use crate::ipc::error::IpcError;
use crate::ipc::registry::Registry;
use crate::ipc::supervisor::Supervisor;

/// Async request/response client over a supervisor's worker.
///
/// Cloning is cheap; clones share the same worker and registry, so any
/// number of tasks can have calls in flight at once.
///
/// # Example
///
/// ```ignore
/// use curavox_bridge::{BridgeConfig, RpcClient, Supervisor};
/// use serde_json::json;
///
/// let supervisor = Supervisor::new(BridgeConfig::load()?);
/// supervisor.start()?;
/// let client = RpcClient::new(&supervisor);
///
/// let status = client.invoke("get_system_status", json!({})).await?;
/// ```
#[derive(Clone)]
pub struct RpcClient {
    supervisor: Supervisor,
    registry: Registry,
}

impl RpcClient {
    pub fn new(supervisor: &Supervisor) -> Self {
        Self {
            supervisor: supervisor.clone(),
            registry: supervisor.registry().clone(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        self.registry.timeout()
    }

    /// Send a request and wait for its response.
    ///
    /// Calls issued before the worker is ready are written anyway and wait
    /// in the pipe. `params` must be a JSON object or null.
    ///
    /// # Errors
    ///
    /// - `IpcError::NoProcess` immediately if there is no live worker
    /// - `IpcError::Worker` if the worker answered with an error
    /// - `IpcError::Timeout` if no answer arrived before the deadline
    /// - `IpcError::Overloaded` if too many calls are already in flight
    /// - `IpcError::InvalidParams` if `params` is not an object
    pub async fn invoke(&self, action: &str, params: Value) -> Result<Value, IpcError> {
        self.send(action, params, self.timeout()).await
    }

    /// Like `invoke`, but first waits for the worker to report ready.
    ///
    /// The wait counts against the request deadline: the call is registered
    /// with whatever is left of it.
    pub async fn invoke_when_ready(&self, action: &str, params: Value) -> Result<Value, IpcError> {
        let timeout = self.timeout();
        let started = Instant::now();
        self.supervisor.wait_ready(timeout).await?;
        let remaining = timeout
            .checked_sub(started.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or(IpcError::Timeout(timeout))?;
        match self.send(action, params, remaining).await {
            Err(IpcError::Timeout(_)) => Err(IpcError::Timeout(timeout)),
            other => other,
        }
    }

    async fn send(&self, action: &str, params: Value, timeout: Duration) -> Result<Value, IpcError> {
        let worker = self
            .supervisor
            .handle()
            .filter(|w| w.is_alive())
            .ok_or(IpcError::NoProcess)?;

        let id = Uuid::new_v4().to_string();
        let line = encode_request(&id, action, params)?;

        // Register before writing so a fast response always finds its entry.
        let response = self.registry.register_with_timeout(&id, timeout)?;

        if let Err(e) = worker.write(line).await {
            self.registry.cancel(&id);
            warn!("Failed to send {} ({}): {}", action, id, e);
            return Err(e);
        }
        debug!("Sent {} ({}) to worker generation {}", action, id, worker.generation());

        match response.await {
            Ok(outcome) => outcome,
            // The registry never drops a sender without settling it except
            // through cancel(), which only this call performs.
            Err(_) => Err(IpcError::Protocol(format!("Request {} dropped", id))),
        }
    }

    /// Invoke and deserialize the result into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        action: &str,
        params: Value,
    ) -> Result<T, IpcError> {
        let value = self.invoke(action, params).await?;
        serde_json::from_value(value)
            .map_err(|e| IpcError::Protocol(format!("Unexpected result for {}: {}", action, e)))
    }
}
