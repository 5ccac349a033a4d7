//! MCP (Model Context Protocol) client implementation for Conduit.
//!
//! Tool servers are reached over one of two transports: newline-delimited
//! JSON-RPC over a child process's stdio, or HTTP POSTs answered on a
//! Server-Sent-Events stream. Each configured server gets an [`McpSession`]
//! that performs the handshake and discovers tools; the [`ServerRegistry`]
//! owns every session and resolves tool names to servers.

pub mod config;
pub mod correlator;
pub mod error;
pub mod jsonrpc;
pub mod process;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
pub mod tool;
pub mod transport;

pub use config::{McpConfig, ServerConfig, TransportConfig};
pub use correlator::Correlator;
pub use error::McpError;
pub use process::{ProcessEvent, ProcessHost, ProcessSpec, SpawnedProcess, TokioProcessHost};
pub use registry::{ServerRegistry, ServerStatusEvent};
pub use session::{McpSession, PROTOCOL_VERSION, ServerRuntimeState, ServerStatus};
pub use tool::{ResourceContent, ToolCallResult, ToolContent, ToolDescriptor};
