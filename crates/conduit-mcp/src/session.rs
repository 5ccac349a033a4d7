//! MCP session: the protocol client for one tool server.
//!
//! Runs the `initialize` → `notifications/initialized` → `tools/list`
//! handshake over a freshly opened transport and exposes `tools/call`.

use crate::config::ServerConfig;
use crate::correlator::Correlator;
use crate::error::McpError;
use crate::jsonrpc::JsonRpcNotification;
use crate::tool::{ToolCallResult, ToolDescriptor, ToolsListResult};
use crate::transport::{Transport, TransportContext};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// MCP protocol version we speak.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Connection status of a tool server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Runtime state of one server, kept apart from its configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerRuntimeState {
    pub status: ServerStatus,
    /// Populated only while connected.
    pub tools: Vec<ToolDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerRuntimeState {
    fn connecting() -> Self {
        Self {
            status: ServerStatus::Connecting,
            ..Self::default()
        }
    }

    fn connected(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            status: ServerStatus::Connected,
            tools,
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ServerStatus::Error,
            tools: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// An open transport and the correlator routing its responses.
struct Connection {
    transport: Transport,
    correlator: Arc<Correlator>,
}

impl Connection {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.correlator
            .request(method, params, |payload| async move {
                self.transport.send(&payload).await
            })
            .await
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let payload = serde_json::to_string(&JsonRpcNotification::new(method, None))?;
        self.transport.send(&payload).await
    }

    async fn close(&self, reason: &str) {
        self.transport.close().await;
        self.correlator.close(reason);
    }
}

/// Protocol client for a single configured server.
pub struct McpSession {
    config: ServerConfig,
    request_timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
    state: Mutex<ServerRuntimeState>,
}

impl McpSession {
    pub fn new(config: ServerConfig, request_timeout: Duration) -> Self {
        Self {
            config,
            request_timeout,
            connection: Mutex::new(None),
            state: Mutex::new(ServerRuntimeState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current state. A connected session whose transport has since closed
    /// reports `error` with the close reason.
    pub fn state(&self) -> ServerRuntimeState {
        let state = self.lock_state().clone();
        if state.status == ServerStatus::Connected {
            if let Some(reason) = self.connection().and_then(|c| c.correlator.closed_reason()) {
                return ServerRuntimeState::failed(reason);
            }
        }
        state
    }

    pub fn status(&self) -> ServerStatus {
        self.state().status
    }

    /// Tools offered by this server; empty unless connected.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.state().tools
    }

    /// Wait until the current transport closes and return why.
    ///
    /// `None` when no transport is open.
    pub async fn closed(&self) -> Option<String> {
        let connection = self.connection()?;
        Some(connection.correlator.closed().await)
    }

    /// Open the transport and run the handshake.
    ///
    /// On failure the session moves to `error` with the message and anything
    /// opened along the way is released.
    pub async fn start(&self, ctx: &TransportContext) -> Result<(), McpError> {
        *self.lock_state() = ServerRuntimeState::connecting();
        tracing::debug!(server = %self.id(), "Starting MCP session");

        match self.handshake(ctx).await {
            Ok(tools) => {
                tracing::info!(
                    server = %self.id(),
                    tools = tools.len(),
                    "MCP server '{}' connected",
                    self.config.display_name()
                );
                *self.lock_state() = ServerRuntimeState::connected(tools);
                Ok(())
            }
            Err(e) => {
                self.release("handshake failed").await;
                tracing::warn!(server = %self.id(), "Failed to start MCP server: {e}");
                *self.lock_state() = ServerRuntimeState::failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(&self, ctx: &TransportContext) -> Result<Vec<ToolDescriptor>, McpError> {
        let correlator = Arc::new(Correlator::new(self.id(), self.request_timeout));
        let transport = Transport::open(&self.config, ctx, Arc::clone(&correlator)).await?;
        tracing::debug!(server = %self.id(), transport = transport.kind(), "Transport open");

        let connection = Arc::new(Connection {
            transport,
            correlator,
        });
        *self.lock_connection() = Some(Arc::clone(&connection));

        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "clientInfo": {
                "name": "conduit",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        connection.request("initialize", Some(init_params)).await?;
        connection.notify("notifications/initialized").await?;

        let result = connection.request("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/list response: {e}")))?;
        Ok(list.tools)
    }

    /// Call a tool on this server.
    ///
    /// Fails immediately with [`McpError::ServerNotRunning`] unless connected.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let connection = self
            .connection()
            .filter(|_| self.status() == ServerStatus::Connected)
            .ok_or_else(|| McpError::ServerNotRunning {
                name: self.id().to_string(),
            })?;

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = connection.request("tools/call", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))
    }

    /// Close the transport and clear runtime state. Safe to call repeatedly
    /// and after a failed start.
    pub async fn stop(&self) {
        self.release("session stopped").await;
        *self.lock_state() = ServerRuntimeState::default();
        tracing::info!(server = %self.id(), "MCP session stopped");
    }

    async fn release(&self, reason: &str) {
        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            connection.close(reason).await;
        }
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.lock_connection().clone()
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerRuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
