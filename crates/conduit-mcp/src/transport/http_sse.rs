//! HTTP+SSE transport for remote MCP servers.
//!
//! Requests go out as independent POSTs; responses come back on a long-lived
//! Server-Sent-Events stream opened at `<url>/sse`. Servers that answer in the
//! POST body are routed through the same correlator, which drops whichever
//! copy arrives second.

use super::route_inbound;
use crate::correlator::Correlator;
use crate::error::McpError;
use crate::jsonrpc::JsonRpcResponse;
use conduit_types::sse::{SseEvent, SseParser};
use futures_util::StreamExt;
use reqwest::Url;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Query keys servers use to hand back a session id in the `endpoint` event.
const SESSION_KEYS: [&str; 2] = ["sessionId", "session_id"];

/// Build the event-stream URL: the configured path suffixed with `/sse`, with
/// headers carried as query parameters since the stream cannot send them.
pub fn sse_url(base: &Url, headers: &HashMap<String, String>) -> Url {
    let mut url = base.clone();
    if !url.path().ends_with("/sse") {
        let path = format!("{}/sse", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    if !headers.is_empty() {
        let mut sorted: Vec<_> = headers.iter().collect();
        sorted.sort();
        let mut query = url.query_pairs_mut();
        for (key, value) in sorted {
            query.append_pair(key, value);
        }
    }
    url
}

/// Pull the session id out of an `endpoint` event, which may be a relative
/// path (`/messages?sessionId=abc`) or an absolute URL.
fn session_from_endpoint(base: &Url, data: &str) -> Option<(String, String)> {
    let endpoint = base.join(data.trim()).ok()?;
    endpoint
        .query_pairs()
        .find(|(key, _)| SESSION_KEYS.contains(&&**key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
}

fn post_url(base: &Url, session: Option<&(String, String)>) -> Url {
    let mut url = base.clone();
    if let Some((key, value)) = session {
        url.query_pairs_mut().append_pair(key, value);
    }
    url
}

pub struct HttpSseTransport {
    server_id: String,
    base: Url,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    correlator: Arc<Correlator>,
    session: Arc<Mutex<Option<(String, String)>>>,
    reader_handle: JoinHandle<()>,
}

impl HttpSseTransport {
    /// Open the event stream and wait for the server's first event.
    ///
    /// Both the HTTP handshake and the first event must arrive within
    /// `connect_timeout`, otherwise the connection fails.
    pub async fn connect(
        server_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        http: reqwest::Client,
        correlator: Arc<Correlator>,
        connect_timeout: Duration,
    ) -> Result<Self, McpError> {
        let http_err = |message: String| McpError::Http {
            server: server_id.to_string(),
            message,
        };
        let base = Url::parse(url).map_err(|e| http_err(format!("invalid URL '{url}': {e}")))?;
        let stream_url = sse_url(&base, headers);
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let timed_out = || McpError::ConnectTimeout {
            server: server_id.to_string(),
            timeout_ms: connect_timeout.as_millis() as u64,
        };

        tracing::debug!(server = %server_id, url = %stream_url, "Opening SSE stream");
        let request = http
            .get(stream_url)
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout_at(deadline, request)
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| http_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_err(format!("event stream returned {status}")));
        }

        let session = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader_handle = tokio::spawn(read_events(
            server_id.to_string(),
            base.clone(),
            response,
            Arc::clone(&correlator),
            Arc::clone(&session),
            ready_tx,
        ));

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                reader_handle.abort();
                return Err(http_err("event stream ended before the handshake".into()));
            }
            Err(_) => {
                reader_handle.abort();
                return Err(timed_out());
            }
        }

        Ok(Self {
            server_id: server_id.to_string(),
            base,
            headers: headers.clone(),
            http,
            correlator,
            session,
            reader_handle,
        })
    }

    /// POST one JSON-RPC message. A response carried in the reply body is
    /// routed to the correlator like one arriving on the stream.
    pub async fn send(&self, payload: &str) -> Result<(), McpError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let url = post_url(&self.base, session.as_ref());

        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let http_err = |message: String| McpError::Http {
            server: self.server_id.clone(),
            message,
        };
        let response = request.send().await.map_err(|e| http_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_err(format!("POST returned {status}")));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = response.bytes().await.map_err(|e| http_err(e.to_string()))?;

        if is_stream {
            let mut parser = SseParser::new();
            let mut events = parser.feed_bytes(&body);
            events.extend(parser.feed("\n\n"));
            for event in events {
                route_event(&self.server_id, &event, &self.correlator);
            }
        } else if !body.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<JsonRpcResponse>(&body) {
                Ok(message) => route_inbound(&self.server_id, message, &self.correlator),
                Err(_) => tracing::debug!(server = %self.server_id, "Ignoring non-JSON POST body"),
            }
        }
        Ok(())
    }

    /// Drop the event stream.
    pub fn close(&self) {
        self.reader_handle.abort();
    }
}

impl Drop for HttpSseTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

async fn read_events(
    server_id: String,
    base: Url,
    response: reqwest::Response,
    correlator: Arc<Correlator>,
    session: Arc<Mutex<Option<(String, String)>>>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    let reason = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                for event in parser.feed_bytes(&chunk) {
                    if event.name() == "endpoint" {
                        let found = session_from_endpoint(&base, &event.data);
                        tracing::debug!(server = %server_id, endpoint = %event.data, "SSE endpoint");
                        if found.is_some() {
                            *session.lock().unwrap_or_else(PoisonError::into_inner) = found;
                        }
                    } else {
                        route_event(&server_id, &event, &correlator);
                    }
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            Some(Err(e)) => break format!("event stream error: {e}"),
            None => break "event stream ended".to_string(),
        }
    };

    tracing::info!(server = %server_id, "{reason}");
    correlator.close(reason);
}

fn route_event(server_id: &str, event: &SseEvent, correlator: &Correlator) {
    if event.name() != "message" {
        tracing::debug!(server = %server_id, event = event.name(), "Ignoring SSE event");
        return;
    }
    match serde_json::from_str::<JsonRpcResponse>(&event.data) {
        Ok(message) => route_inbound(server_id, message, correlator),
        Err(_) => tracing::debug!(server = %server_id, "Dropping non-JSON SSE data: {}", event.data),
    }
}
