//! Server registry: configured tool servers and their live sessions.
//!
//! Constructed once by the application and shared by handle. Servers that
//! fail to start are recorded per server and never block the others.

use crate::config::{McpConfig, ServerConfig};
use crate::error::McpError;
use crate::process::{ProcessHost, TokioProcessHost};
use crate::session::{McpSession, ServerRuntimeState, ServerStatus};
use crate::tool::{ToolCallResult, ToolDescriptor};
use crate::transport::TransportContext;
use conduit_types::ToolDefinition;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// A server changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatusEvent {
    pub server_id: String,
    pub state: ServerRuntimeState,
}

/// Holds the configured servers and the session for each running one.
pub struct ServerRegistry {
    configs: Mutex<Vec<ServerConfig>>,
    sessions: Arc<Mutex<HashMap<String, Arc<McpSession>>>>,
    ctx: TransportContext,
    request_timeout: Duration,
    events: broadcast::Sender<ServerStatusEvent>,
}

impl ServerRegistry {
    /// Registry that launches stdio servers as real processes.
    pub fn new(config: &McpConfig) -> Self {
        Self::with_host(config, Arc::new(TokioProcessHost::new()))
    }

    /// Registry using the given process host for stdio servers.
    pub fn with_host(config: &McpConfig, host: Arc<dyn ProcessHost>) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            configs: Mutex::new(config.servers.clone()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ctx: TransportContext {
                host,
                http: reqwest::Client::new(),
                connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            },
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            events,
        }
    }

    /// Receive every status transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerStatusEvent> {
        self.events.subscribe()
    }

    /// Configured servers in registry order.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.lock_configs().clone()
    }

    pub fn add_server(&self, config: ServerConfig) -> Result<(), McpError> {
        let mut configs = self.lock_configs();
        if configs.iter().any(|c| c.id == config.id) {
            return Err(McpError::DuplicateServer { id: config.id });
        }
        configs.push(config);
        Ok(())
    }

    /// Replace a server's configuration. A live session is stopped when its
    /// transport settings change or the server is disabled.
    pub async fn update_server(&self, config: ServerConfig) -> Result<(), McpError> {
        let needs_stop = {
            let mut configs = self.lock_configs();
            let slot = configs
                .iter_mut()
                .find(|c| c.id == config.id)
                .ok_or_else(|| McpError::UnknownServer {
                    id: config.id.clone(),
                })?;
            let changed = slot.transport != config.transport || !config.enabled;
            *slot = config.clone();
            changed
        };
        if needs_stop {
            self.stop_server(&config.id).await;
        }
        Ok(())
    }

    /// Stop and forget a server.
    pub async fn remove_server(&self, id: &str) -> Result<(), McpError> {
        if self.config(id).is_none() {
            return Err(McpError::UnknownServer { id: id.to_string() });
        }
        self.stop_server(id).await;
        self.lock_configs().retain(|c| c.id != id);
        Ok(())
    }

    fn config(&self, id: &str) -> Option<ServerConfig> {
        self.lock_configs().iter().find(|c| c.id == id).cloned()
    }

    pub fn session(&self, id: &str) -> Option<Arc<McpSession>> {
        self.lock_sessions().get(id).cloned()
    }

    /// Start one server. A server that is already connecting or connected
    /// keeps its single session; one in `error` is started afresh.
    pub async fn start_server(&self, id: &str) -> Result<(), McpError> {
        let config = self
            .config(id)
            .ok_or_else(|| McpError::UnknownServer { id: id.to_string() })?;

        let session = {
            let mut sessions = self.lock_sessions();
            if sessions
                .get(id)
                .is_some_and(|s| s.status() != ServerStatus::Error)
            {
                return Ok(());
            }
            let session = Arc::new(McpSession::new(config, self.request_timeout));
            sessions.insert(id.to_string(), Arc::clone(&session));
            session
        };

        self.publish(id, ServerRuntimeState {
            status: ServerStatus::Connecting,
            ..ServerRuntimeState::default()
        });
        let result = session.start(&self.ctx).await;
        self.publish(id, session.state());
        if result.is_ok() {
            self.watch_disconnect(id, session);
        }
        result
    }

    /// Publish an `error` state if `session` loses its transport while it is
    /// still the registered session for `id`.
    fn watch_disconnect(&self, id: &str, session: Arc<McpSession>) {
        let sessions = Arc::clone(&self.sessions);
        let events = self.events.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let Some(reason) = session.closed().await else {
                return;
            };
            let current = sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if !current {
                return;
            }
            tracing::warn!(server = %id, "MCP server disconnected: {reason}");
            let _ = events.send(ServerStatusEvent {
                server_id: id,
                state: session.state(),
            });
        });
    }

    /// Stop one server. Stopping a server that is not running is a no-op.
    pub async fn stop_server(&self, id: &str) {
        let session = self.lock_sessions().remove(id);
        if let Some(session) = session {
            session.stop().await;
            self.publish(id, ServerRuntimeState::default());
        }
    }

    pub async fn restart_server(&self, id: &str) -> Result<(), McpError> {
        self.stop_server(id).await;
        self.start_server(id).await
    }

    /// Start every enabled server concurrently.
    ///
    /// Each start is isolated: the returned list holds one outcome per
    /// server, in registry order.
    pub async fn start_all_enabled(&self) -> Vec<(String, Result<(), McpError>)> {
        let ids: Vec<String> = self
            .lock_configs()
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.id.clone())
            .collect();

        let results = join_all(ids.iter().map(|id| self.start_server(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Stop every active session concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        join_all(ids.iter().map(|id| self.stop_server(id))).await;
    }

    /// Runtime state of a configured server.
    pub fn state(&self, id: &str) -> Option<ServerRuntimeState> {
        self.config(id)?;
        Some(
            self.session(id)
                .map(|s| s.state())
                .unwrap_or_default(),
        )
    }

    /// States of all configured servers, in registry order.
    pub fn states(&self) -> Vec<(String, ServerRuntimeState)> {
        let ids: Vec<String> = self.lock_configs().iter().map(|c| c.id.clone()).collect();
        ids.into_iter()
            .map(|id| {
                let state = self.session(&id).map(|s| s.state()).unwrap_or_default();
                (id, state)
            })
            .collect()
    }

    /// Every tool offered by a connected server, as `(server_id, tool)` in
    /// registry order.
    pub fn all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        self.connected_sessions()
            .into_iter()
            .flat_map(|session| {
                let id = session.id().to_string();
                session
                    .tools()
                    .into_iter()
                    .map(move |tool| (id.clone(), tool))
            })
            .collect()
    }

    /// Tool definitions to offer the model.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.all_tools()
            .iter()
            .map(|(_, tool)| tool.to_definition())
            .collect()
    }

    /// The first connected server, in registry order, offering `tool_name`.
    ///
    /// Duplicate names across servers are not disambiguated further.
    pub fn find_tool_server(&self, tool_name: &str) -> Option<String> {
        self.connected_sessions()
            .into_iter()
            .find(|s| s.tools().iter().any(|t| t.name == tool_name))
            .map(|s| s.id().to_string())
    }

    /// Call a tool on a specific server.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        if self.config(server_id).is_none() {
            return Err(McpError::UnknownServer {
                id: server_id.to_string(),
            });
        }
        let session = self
            .session(server_id)
            .ok_or_else(|| McpError::ServerNotRunning {
                name: server_id.to_string(),
            })?;
        session.call_tool(name, arguments).await
    }

    fn connected_sessions(&self) -> Vec<Arc<McpSession>> {
        let ids: Vec<String> = self.lock_configs().iter().map(|c| c.id.clone()).collect();
        ids.iter()
            .filter_map(|id| self.session(id))
            .filter(|s| s.status() == ServerStatus::Connected)
            .collect()
    }

    fn publish(&self, id: &str, state: ServerRuntimeState) {
        // No subscribers is fine.
        let _ = self.events.send(ServerStatusEvent {
            server_id: id.to_string(),
            state,
        });
    }

    fn lock_configs(&self) -> MutexGuard<'_, Vec<ServerConfig>> {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<McpSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
