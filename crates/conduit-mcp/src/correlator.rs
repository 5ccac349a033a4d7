//! Request correlator: matches inbound JSON-RPC responses to the requests
//! that caused them.
//!
//! Every pending request owns a one-shot completion handle keyed by id. The
//! response path and the timeout path both race to remove that entry from
//! the map; whoever removes it decides the outcome, the other is a no-op.

use crate::error::McpError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

type Completion = oneshot::Sender<Result<serde_json::Value, McpError>>;

/// Tracks outstanding requests for one session.
pub struct Correlator {
    server: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Completion>>,
    closed: watch::Sender<Option<String>>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: watch::Sender::new(None),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Why the transport closed, if it did.
    pub fn closed_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Resolves with the close reason once [`Correlator::close`] has run.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone())
            .unwrap_or_default()
    }

    /// Send a request through `transmit` and wait for its response.
    ///
    /// The entry is registered before `transmit` runs so that a transport
    /// which answers synchronously (e.g. in an HTTP response body) can
    /// deliver straight back into [`Correlator::dispatch`].
    pub async fn request<F, Fut>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        transmit: F,
    ) -> Result<serde_json::Value, McpError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), McpError>>,
    {
        if let Some(reason) = self.closed_reason() {
            return Err(McpError::TransportClosed {
                server: self.server.clone(),
                reason,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, mut rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        // Removes the entry if this future is dropped (e.g. on cancellation).
        let _guard = PendingGuard { correlator: self, id };

        tracing::debug!(server = %self.server, id, method, "MCP request");

        // The deadline covers transmission too: an HTTP POST may hang.
        let exchange = async {
            transmit(payload).await?;
            (&mut rx).await.unwrap_or_else(|_| Err(self.closed_error()))
        };
        let waited = tokio::time::timeout(self.timeout, exchange).await;
        match waited {
            Ok(outcome) => outcome,
            Err(_) if self.lock_pending().remove(&id).is_some() => {
                tracing::warn!(server = %self.server, id, method, "MCP request timed out");
                Err(McpError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            // The response claimed the entry first; its value is already sent.
            Err(_) => rx.await.unwrap_or_else(|_| Err(self.closed_error())),
        }
    }

    /// Route an inbound response to its pending request.
    ///
    /// Returns `false` when no request is waiting on that id (duplicate,
    /// late, or unsolicited response); the message is discarded.
    pub fn dispatch(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        let Some(tx) = self.lock_pending().remove(&id) else {
            tracing::debug!(server = %self.server, id, "Discarding response with no pending request");
            return false;
        };

        let outcome = match (response.error, response.result) {
            (Some(err), _) => Err(McpError::JsonRpc {
                server: self.server.clone(),
                code: err.code,
                message: err.message,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        };
        // The receiver may have been dropped by a cancelled caller.
        let _ = tx.send(outcome);
        true
    }

    /// Fail every pending request and refuse new ones.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.closed.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason.clone());
            true
        });
        let drained: Vec<Completion> = self.lock_pending().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(McpError::TransportClosed {
                server: self.server.clone(),
                reason: reason.clone(),
            }));
        }
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server.clone(),
            reason: self
                .closed_reason()
                .unwrap_or_else(|| "response channel dropped".to_string()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, Completion>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.lock_pending().remove(&self.id);
    }
}
