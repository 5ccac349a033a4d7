//! In-process scripted MCP servers for tests.
//!
//! [`ScriptedHost`] implements [`ProcessHost`] without spawning anything:
//! each "process" answers JSON-RPC requests written to its stdin from a
//! [`ScriptedServer`] script, emitting replies as stdout events.

use crate::error::McpError;
use crate::process::{HostFuture, ProcessEvent, ProcessHost, ProcessSpec, SpawnedProcess};
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// How a scripted server answers one request.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Result(Value),
    Error { code: i64, message: String },
    /// Never answer.
    Silent,
}

type CallHandler = Arc<dyn Fn(&str, &Value) -> ScriptedReply + Send + Sync>;

/// Script for one fake tool server.
#[derive(Clone)]
pub struct ScriptedServer {
    tools: Vec<Value>,
    on_call: CallHandler,
    tools_list: Option<ScriptedReply>,
    banner: Option<String>,
    chunk_size: usize,
}

impl Default for ScriptedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedServer {
    /// A server with no tools whose calls echo `arguments.text`.
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            on_call: Arc::new(|_: &str, args: &Value| echo_reply(args)),
            tools_list: None,
            banner: None,
            chunk_size: 0,
        }
    }

    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}}
        }));
        self
    }

    /// Answer `tools/call` with `handler(tool_name, arguments)`.
    pub fn on_call(
        mut self,
        handler: impl Fn(&str, &Value) -> ScriptedReply + Send + Sync + 'static,
    ) -> Self {
        self.on_call = Arc::new(handler);
        self
    }

    /// Answer `tools/list` with `reply` instead of the tool list.
    pub fn tools_list_reply(mut self, reply: ScriptedReply) -> Self {
        self.tools_list = Some(reply);
        self
    }

    /// Print a non-JSON line to stdout on startup.
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = Some(banner.to_string());
        self
    }

    /// Deliver stdout in chunks of at most `size` bytes.
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    fn reply_to(&self, method: &str, params: &Value) -> ScriptedReply {
        match method {
            "initialize" => ScriptedReply::Result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "0.0.0"}
            })),
            "tools/list" => self
                .tools_list
                .clone()
                .unwrap_or_else(|| ScriptedReply::Result(json!({"tools": self.tools}))),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                (self.on_call)(name, &params["arguments"])
            }
            _ => ScriptedReply::Error {
                code: -32601,
                message: format!("Method not found: {method}"),
            },
        }
    }
}

fn echo_reply(args: &Value) -> ScriptedReply {
    let text = match args.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => args.to_string(),
    };
    ScriptedReply::Result(json!({"content": [{"type": "text", "text": text}]}))
}

struct Running {
    server: ScriptedServer,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

/// A [`ProcessHost`] whose processes are [`ScriptedServer`]s.
#[derive(Default)]
pub struct ScriptedHost {
    scripts: Mutex<HashMap<String, ScriptedServer>>,
    running: Mutex<HashMap<String, Running>>,
    received: Mutex<HashMap<String, Vec<Value>>>,
    spawns: Mutex<HashMap<String, usize>>,
    next_pid: AtomicU32,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, server_id: &str, server: ScriptedServer) -> Self {
        self.add_server(server_id, server);
        self
    }

    /// Register (or replace) the script for `server_id`. Spawning an id with
    /// no script fails like a missing executable.
    pub fn add_server(&self, server_id: &str, server: ScriptedServer) {
        lock(&self.scripts).insert(server_id.to_string(), server);
    }

    /// Every message the server received, in order.
    pub fn requests(&self, server_id: &str) -> Vec<Value> {
        lock(&self.received)
            .get(server_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Methods of every message the server received, in order.
    pub fn methods(&self, server_id: &str) -> Vec<String> {
        self.requests(server_id)
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_string))
            .collect()
    }

    /// `(tool name, arguments)` of every `tools/call` received.
    pub fn calls(&self, server_id: &str) -> Vec<(String, Value)> {
        self.requests(server_id)
            .into_iter()
            .filter(|m| m["method"] == "tools/call")
            .map(|m| {
                let name = m["params"]["name"].as_str().unwrap_or_default().to_string();
                (name, m["params"]["arguments"].clone())
            })
            .collect()
    }

    pub fn spawn_count(&self, server_id: &str) -> usize {
        lock(&self.spawns).get(server_id).copied().unwrap_or(0)
    }

    /// Simulate the process dying.
    pub fn crash(&self, server_id: &str) {
        if let Some(running) = lock(&self.running).remove(server_id) {
            let _ = running.events.send(ProcessEvent::Exit(Some(1)));
        }
    }

    fn emit(running: &Running, line: &str) {
        let bytes = format!("{line}\n").into_bytes();
        let size = if running.server.chunk_size == 0 {
            bytes.len()
        } else {
            running.server.chunk_size
        };
        for chunk in bytes.chunks(size) {
            let _ = running
                .events
                .send(ProcessEvent::Stdout(Bytes::copy_from_slice(chunk)));
        }
    }
}

impl ProcessHost for ScriptedHost {
    fn spawn(&self, server_id: &str, spec: &ProcessSpec) -> Result<SpawnedProcess, McpError> {
        let server = lock(&self.scripts)
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::SpawnFailed {
                name: spec.command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no scripted server"),
            })?;
        *lock(&self.spawns).entry(server_id.to_string()).or_default() += 1;

        let (tx, events) = mpsc::unbounded_channel();
        let running = Running { server, events: tx };
        if let Some(banner) = &running.server.banner {
            Self::emit(&running, banner);
            let _ = running
                .events
                .send(ProcessEvent::Stderr(format!("{server_id} starting")));
        }
        lock(&self.running).insert(server_id.to_string(), running);

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed) + 1000;
        Ok(SpawnedProcess {
            pid: Some(pid),
            events,
        })
    }

    fn write<'a>(&'a self, server_id: &'a str, data: &'a [u8]) -> HostFuture<'a, ()> {
        Box::pin(async move {
            let running = lock(&self.running);
            let running = running
                .get(server_id)
                .ok_or_else(|| McpError::ServerNotRunning {
                    name: server_id.to_string(),
                })?;

            for line in String::from_utf8_lossy(data).lines() {
                let message: Value = serde_json::from_str(line)?;
                lock(&self.received)
                    .entry(server_id.to_string())
                    .or_default()
                    .push(message.clone());

                let (Some(id), Some(method)) = (message.get("id"), message["method"].as_str())
                else {
                    continue;
                };
                let reply = match running.server.reply_to(method, &message["params"]) {
                    ScriptedReply::Result(result) => {
                        json!({"jsonrpc": "2.0", "id": id, "result": result})
                    }
                    ScriptedReply::Error { code, message } => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": code, "message": message}
                    }),
                    ScriptedReply::Silent => continue,
                };
                Self::emit(running, &reply.to_string());
            }
            Ok(())
        })
    }

    fn kill<'a>(&'a self, server_id: &'a str) -> HostFuture<'a, ()> {
        Box::pin(async move {
            if let Some(running) = lock(&self.running).remove(server_id) {
                let _ = running.events.send(ProcessEvent::Exit(None));
            }
            Ok(())
        })
    }

    fn is_running(&self, server_id: &str) -> bool {
        lock(&self.running).contains_key(server_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
