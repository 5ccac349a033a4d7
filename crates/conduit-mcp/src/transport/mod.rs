//! Transports carrying JSON-RPC between a session and its tool server.
//!
//! Exactly two exist, so they are a closed enum selected once from the
//! server's configured transport tag.

mod http_sse;
mod stdio;

pub use http_sse::{HttpSseTransport, sse_url};
pub use stdio::{LineBuffer, StdioTransport};

use crate::config::{ServerConfig, TransportConfig};
use crate::correlator::Correlator;
use crate::error::McpError;
use crate::jsonrpc::JsonRpcResponse;
use crate::process::{ProcessHost, ProcessSpec};
use std::sync::Arc;
use std::time::Duration;

/// Shared resources transports are built from.
#[derive(Clone)]
pub struct TransportContext {
    pub host: Arc<dyn ProcessHost>,
    pub http: reqwest::Client,
    pub connect_timeout: Duration,
}

pub enum Transport {
    Stdio(StdioTransport),
    HttpSse(HttpSseTransport),
}

impl Transport {
    /// Open the transport described by `config`, routing inbound responses
    /// to `correlator`.
    pub async fn open(
        config: &ServerConfig,
        ctx: &TransportContext,
        correlator: Arc<Correlator>,
    ) -> Result<Self, McpError> {
        match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                login_shell,
            } => {
                let spec = ProcessSpec {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    login_shell: *login_shell,
                };
                StdioTransport::start(&config.id, &spec, Arc::clone(&ctx.host), correlator)
                    .map(Self::Stdio)
            }
            TransportConfig::Http { url, headers } => HttpSseTransport::connect(
                &config.id,
                url,
                headers,
                ctx.http.clone(),
                correlator,
                ctx.connect_timeout,
            )
            .await
            .map(Self::HttpSse),
        }
    }

    /// Transmit one serialized JSON-RPC message.
    pub async fn send(&self, payload: &str) -> Result<(), McpError> {
        match self {
            Self::Stdio(t) => t.send(payload).await,
            Self::HttpSse(t) => t.send(payload).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Stdio(t) => t.close().await,
            Self::HttpSse(t) => t.close(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::HttpSse(_) => "http+sse",
        }
    }
}

/// Hand an inbound message to the correlator if it answers one of our requests.
fn route_inbound(server_id: &str, message: JsonRpcResponse, correlator: &Correlator) {
    if message.is_response() {
        correlator.dispatch(message);
    } else if let Some(method) = message.method {
        tracing::debug!(server = %server_id, %method, "Ignoring server-initiated message");
    }
}
