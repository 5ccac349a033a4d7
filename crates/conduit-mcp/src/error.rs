//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("MCP server '{name}' is not running")]
    ServerNotRunning { name: String },

    #[error("Unknown MCP server '{id}'")]
    UnknownServer { id: String },

    #[error("MCP server '{id}' is already configured")]
    DuplicateServer { id: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server '{server}' timed out on '{method}' after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("MCP server '{server}' did not open its event stream within {timeout_ms}ms")]
    ConnectTimeout { server: String, timeout_ms: u64 },

    #[error("HTTP error talking to '{server}': {message}")]
    Http { server: String, message: String },

    #[error("Transport for '{server}' closed: {reason}")]
    TransportClosed { server: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
