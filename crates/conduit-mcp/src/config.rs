//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Timeout applied to every MCP request (default 30s).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Time allowed for an HTTP+SSE server to open its event stream.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_enabled() -> bool {
    true
}

/// Top-level MCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Servers in registry order. Order decides which server wins when two
    /// expose a tool with the same name.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            servers: Vec::new(),
        }
    }
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl ServerConfig {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                login_shell: false,
            },
        }
    }

    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            transport: TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Transport-specific settings, tagged by `transport = "stdio" | "http"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        /// Command to run (e.g., "npx", "python").
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables to set for the server process.
        #[serde(default)]
        env: HashMap<String, String>,
        /// Run through the user's login shell so its PATH applies.
        #[serde(default)]
        login_shell: bool,
    },
    Http {
        /// Endpoint for POSTed requests; the event stream lives at `<url>/sse`.
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}
