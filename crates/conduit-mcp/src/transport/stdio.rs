//! Stdio transport for MCP server communication.
//!
//! Frames JSON-RPC messages as newline-delimited JSON over a child process's
//! stdin/stdout. The process itself is owned by a [`ProcessHost`].

use super::route_inbound;
use crate::correlator::Correlator;
use crate::error::McpError;
use crate::process::{ProcessEvent, ProcessHost, ProcessSpec};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Splits an arbitrary byte stream into complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes.
    ///
    /// A trailing partial line is held back until more data arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&line[..pos]));
        }
        lines
    }

    /// Take whatever unterminated data is left.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.strip_suffix('\r').unwrap_or(&line).to_string()
}

/// Newline-delimited JSON-RPC over a hosted process.
pub struct StdioTransport {
    server_id: String,
    host: Arc<dyn ProcessHost>,
    reader_handle: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn the server process and start routing its stdout to `correlator`.
    pub fn start(
        server_id: &str,
        spec: &ProcessSpec,
        host: Arc<dyn ProcessHost>,
        correlator: Arc<Correlator>,
    ) -> Result<Self, McpError> {
        let mut spawned = host.spawn(server_id, spec)?;

        let id = server_id.to_string();
        let reader_handle = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let reason = loop {
                match spawned.events.recv().await {
                    Some(ProcessEvent::Stdout(chunk)) => {
                        for line in lines.push(&chunk) {
                            handle_line(&id, &line, &correlator);
                        }
                    }
                    Some(ProcessEvent::Stderr(line)) => {
                        tracing::warn!(server = %id, "stderr: {line}");
                    }
                    Some(ProcessEvent::Exit(code)) => {
                        break format!("process exited with code {code:?}");
                    }
                    None => break "process output closed".to_string(),
                }
            };
            if let Some(line) = lines.take_remainder() {
                handle_line(&id, &line, &correlator);
            }
            tracing::info!(server = %id, "{reason}");
            correlator.close(reason);
        });

        Ok(Self {
            server_id: server_id.to_string(),
            host,
            reader_handle,
        })
    }

    /// Write one framed message to the process.
    pub async fn send(&self, payload: &str) -> Result<(), McpError> {
        let mut framed = String::with_capacity(payload.len() + 1);
        framed.push_str(payload);
        framed.push('\n');
        self.host.write(&self.server_id, framed.as_bytes()).await
    }

    /// Kill the process and stop reading its output.
    pub async fn close(&self) {
        if let Err(e) = self.host.kill(&self.server_id).await {
            tracing::warn!(server = %self.server_id, "Failed to kill MCP server: {e}");
        }
        self.reader_handle.abort();
    }
}

fn handle_line(server_id: &str, line: &str, correlator: &Correlator) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str(line) {
        Ok(message) => route_inbound(server_id, message, correlator),
        // Banners and logs printed to stdout are not protocol traffic.
        Err(_) => tracing::debug!(server = %server_id, "Dropping non-JSON stdout line: {line}"),
    }
}
