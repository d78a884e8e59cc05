//! Correlated request/response round-trips over the runtime message bus.
//!
//! A caller registers a single-shot listener under a fresh request id, sends
//! its request, and waits for the matching `*_RESPONSE` to be resolved by
//! whoever receives it. The listener is always deregistered, whether the
//! call completes, times out or is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::RpcError;

#[derive(Default)]
struct Waiting {
    next_id: u64,
    listeners: HashMap<u64, oneshot::Sender<Value>>,
}

#[derive(Clone, Default)]
pub struct PendingReplies {
    waiting: Arc<Mutex<Waiting>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Option<(u64, oneshot::Receiver<Value>)> {
        let mut waiting = self.waiting.lock().ok()?;
        waiting.next_id += 1;
        let id = waiting.next_id;
        let (tx, rx) = oneshot::channel();
        waiting.listeners.insert(id, tx);
        Some((id, rx))
    }

    /// Completes the call waiting on `id`. Returns false for unknown or
    /// already completed ids.
    pub fn resolve(&self, id: u64, reply: Value) -> bool {
        let listener = match self.waiting.lock() {
            Ok(mut waiting) => waiting.listeners.remove(&id),
            Err(_) => None,
        };
        match listener {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(request_id = id, "reply for unknown request id dropped");
                false
            }
        }
    }

    pub fn forget(&self, id: u64) {
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.listeners.remove(&id);
        }
    }

    pub fn pending(&self) -> usize {
        self.waiting
            .lock()
            .map(|waiting| waiting.listeners.len())
            .unwrap_or_default()
    }

    /// Registers a listener, runs `send` with the new request id and waits up
    /// to `timeout` for the reply, decoded as `T`.
    pub async fn call<T, F, Fut>(
        &self,
        label: &'static str,
        timeout: Duration,
        send: F,
    ) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<(), RpcError>>,
    {
        let (id, rx) = self
            .register()
            .ok_or(RpcError::Disconnected { label })?;
        let _listener = scopeguard::guard(id, |id| self.forget(id));

        send(id).await?;
        trace!(label, request_id = id, "awaiting reply");

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RpcError::Disconnected { label }),
            Err(_) => return Err(RpcError::Timeout { label, after: timeout }),
        };

        serde_json::from_value(reply).map_err(|err| RpcError::Decode {
            label,
            reason: err.to_string(),
        })
    }
}
