//! `Orchestrator::run` against a mock model and scripted tool servers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::{MAX_TOOL_ITERATIONS, ModelSettings, Orchestrator, TurnEvent, TurnOutcome};
use conduit_mcp::testing::{ScriptedHost, ScriptedReply, ScriptedServer};
use conduit_mcp::{McpConfig, ServerConfig, ServerRegistry};
use conduit_types::provider::{ChunkCallback, LlmService};
use conduit_types::{
    ApiError, ChatMessage, ChatRequest, ChatResponse, ConduitError, Role, ToolCall, ToolCallStatus,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// A model that replays queued replies and then repeats `fallback`.
struct MockLlm {
    replies: Mutex<VecDeque<Result<ChatResponse, ApiError>>>,
    fallback: ChatResponse,
    chunks: Vec<&'static str>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlm {
    fn new(replies: Vec<Result<ChatResponse, ApiError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: ChatResponse::text("fallback"),
            chunks: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn repeating(fallback: ChatResponse) -> Self {
        Self {
            fallback,
            ..Self::new(Vec::new())
        }
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmService for MockLlm {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        on_chunk: Option<ChunkCallback<'a>>,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, ApiError>> + Send + 'a>> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(cb) = on_chunk {
            for chunk in self.chunks.iter().copied() {
                cb(chunk);
            }
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()));
        Box::pin(async move { reply })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn call(id: &str, name: &str, text: &str) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: json!({"text": text}),
    }
}

/// Start a registry whose servers are scripted by `host`.
async fn start_registry(
    host: ScriptedHost,
    ids: &[&str],
) -> (Arc<ScriptedHost>, Arc<ServerRegistry>) {
    let host = Arc::new(host);
    let config = McpConfig {
        servers: ids
            .iter()
            .map(|id| ServerConfig::stdio(*id, "scripted", vec![]))
            .collect(),
        ..McpConfig::default()
    };
    let registry = Arc::new(ServerRegistry::with_host(&config, host.clone()));
    for (id, result) in registry.start_all_enabled().await {
        result.unwrap_or_else(|e| panic!("{id} failed to start: {e}"));
    }
    (host, registry)
}

fn echo_host() -> ScriptedHost {
    ScriptedHost::new().with_server(
        "local",
        ScriptedServer::new()
            .with_tool("echo", "Echo text")
            .with_tool("slow", "Never answers")
            .with_tool("fail", "Always reports an error")
            .on_call(|name, args| match name {
                "slow" => ScriptedReply::Silent,
                "fail" => ScriptedReply::Result(json!({
                    "content": [{"type": "text", "text": "disk full"}],
                    "isError": true
                })),
                _ => ScriptedReply::Result(json!({
                    "content": [{"type": "text", "text": args["text"]}]
                })),
            }),
    )
}

fn orchestrator(llm: Arc<MockLlm>, registry: Arc<ServerRegistry>) -> Orchestrator {
    Orchestrator::new(
        llm,
        registry,
        ModelSettings {
            model: "mock-model".into(),
            system_prompt: Some("Use tools.".into()),
            ..ModelSettings::default()
        },
    )
}

#[tokio::test]
async fn two_tool_calls_run_in_order() {
    let (host, registry) = start_registry(echo_host(), &["local"]).await;
    let llm = Arc::new(MockLlm::new(vec![
        Ok(ChatResponse::with_tool_calls(
            "Let me check.",
            vec![call("call_1", "echo", "first"), call("call_2", "echo", "second")],
        )),
        Ok(ChatResponse::text("All done.")),
    ]));
    let orch = orchestrator(llm.clone(), registry.clone());

    let mut messages = vec![ChatMessage::user("run both")];
    let mut events = Vec::new();
    let outcome = orch
        .run(&mut messages, CancellationToken::new(), |e| events.push(e))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
    );

    let assistant = &messages[1];
    assert_eq!(assistant.content, "Let me check.");
    assert!(!assistant.is_streaming);
    assert_eq!(assistant.tool_calls.len(), 2);
    assert!(assistant.tool_calls.iter().all(|r| r.status == ToolCallStatus::Success));
    assert_eq!(assistant.tool_calls[1].result.as_deref(), Some("second"));

    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(messages[2].content, "first");
    assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_2"));
    assert_eq!(messages[3].content, "second");
    assert!(!messages[2].is_error && !messages[3].is_error);

    assert_eq!(messages[4].content, "All done.");
    assert!(!messages[4].is_streaming);

    let calls: Vec<String> = host
        .calls("local")
        .into_iter()
        .map(|(name, args)| format!("{name}:{}", args["text"]))
        .collect();
    assert_eq!(calls, [r#"echo:"first""#, r#"echo:"second""#]);

    // Tools offered means no streaming; the placeholder is never sent.
    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].stream);
    assert_eq!(requests[0].tools.as_ref().map(Vec::len), Some(3));
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].system_prompt.as_deref(), Some("Use tools."));
    let second: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
    assert_eq!(second, [Role::User, Role::Assistant, Role::Tool, Role::Tool]);

    let statuses: Vec<(String, ToolCallStatus)> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolCallStatus(r) => Some((r.call.id.clone(), r.status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        [
            ("call_1".to_string(), ToolCallStatus::Pending),
            ("call_2".to_string(), ToolCallStatus::Pending),
            ("call_1".to_string(), ToolCallStatus::Executing),
            ("call_1".to_string(), ToolCallStatus::Success),
            ("call_2".to_string(), ToolCallStatus::Executing),
            ("call_2".to_string(), ToolCallStatus::Success),
        ]
    );
    assert!(matches!(events.last(), Some(TurnEvent::Done)));

    registry.stop_all().await;
}

#[tokio::test]
async fn unknown_tool_yields_error_without_calling_a_server() {
    let (host, registry) = start_registry(echo_host(), &["local"]).await;
    let llm = Arc::new(MockLlm::new(vec![
        Ok(ChatResponse::with_tool_calls("", vec![call("call_x", "missing", "?")])),
        Ok(ChatResponse::text("Sorry.")),
    ]));
    let orch = orchestrator(llm, registry.clone());

    let mut messages = vec![ChatMessage::user("use a tool that does not exist")];
    let outcome = orch
        .run(&mut messages, CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let result = &messages[2];
    assert_eq!(result.role, Role::Tool);
    assert!(result.is_error);
    assert!(result.content.contains("missing"), "{}", result.content);
    assert_eq!(messages[1].tool_calls[0].status, ToolCallStatus::Error);
    assert!(host.calls("local").is_empty());

    registry.stop_all().await;
}

#[tokio::test]
async fn tool_reported_error_is_fed_back() {
    let (_host, registry) = start_registry(echo_host(), &["local"]).await;
    let llm = Arc::new(MockLlm::new(vec![
        Ok(ChatResponse::with_tool_calls("", vec![call("call_f", "fail", "")])),
        Ok(ChatResponse::text("The disk is full.")),
    ]));
    let orch = orchestrator(llm.clone(), registry.clone());

    let mut messages = vec![ChatMessage::user("write a file")];
    orch.run(&mut messages, CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(messages[2].is_error);
    assert_eq!(messages[2].content, "disk full");
    let fed_back = &llm.requests()[1].messages[2];
    assert!(fed_back.is_error);
    assert_eq!(fed_back.content, "disk full");

    registry.stop_all().await;
}

#[tokio::test]
async fn loop_stops_at_iteration_limit() {
    let (host, registry) = start_registry(echo_host(), &["local"]).await;
    let llm = Arc::new(MockLlm::repeating(ChatResponse::with_tool_calls(
        "",
        vec![call("again", "echo", "loop")],
    )));
    let orch = orchestrator(llm.clone(), registry.clone());

    let mut messages = vec![ChatMessage::user("keep going")];
    let mut events = Vec::new();
    let outcome = orch
        .run(&mut messages, CancellationToken::new(), |e| events.push(e))
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::IterationLimit);
    assert_eq!(llm.requests().len(), MAX_TOOL_ITERATIONS);
    assert_eq!(host.calls("local").len(), MAX_TOOL_ITERATIONS);
    assert!(matches!(events.last(), Some(TurnEvent::IterationLimitReached)));
    assert!(messages.iter().all(|m| !m.is_streaming));

    registry.stop_all().await;
}

#[tokio::test]
async fn cancellation_during_tool_call_aborts_turn() {
    let (_host, registry) = start_registry(echo_host(), &["local"]).await;
    let llm = Arc::new(MockLlm::new(vec![Ok(ChatResponse::with_tool_calls(
        "",
        vec![call("call_s", "slow", ""), call("call_e", "echo", "never")],
    ))]));
    let orch = orchestrator(llm.clone(), registry.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut messages = vec![ChatMessage::user("hang")];
    let mut events = Vec::new();
    let outcome = orch
        .run(&mut messages, cancel, |e| events.push(e))
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::Aborted);
    assert!(matches!(events.last(), Some(TurnEvent::Aborted)));
    assert_eq!(llm.requests().len(), 1);

    let assistant = &messages[1];
    assert!(!assistant.is_streaming);
    assert!(!assistant.is_error);
    for record in &assistant.tool_calls {
        assert_eq!(record.status, ToolCallStatus::Error);
        assert_eq!(record.result.as_deref(), Some("Cancelled"));
    }
    // One result per call and no new placeholder.
    assert_eq!(messages.len(), 4);
    assert!(messages[2..].iter().all(|m| m.role == Role::Tool && m.is_error));

    registry.stop_all().await;
}

#[tokio::test]
async fn streams_text_when_no_tools_are_offered() {
    let (_host, registry) = start_registry(ScriptedHost::new(), &[]).await;
    let llm = Arc::new(MockLlm {
        chunks: vec!["Hel", "lo"],
        ..MockLlm::new(vec![Ok(ChatResponse::text("Hello"))])
    });
    let orch = orchestrator(llm.clone(), registry);

    let mut messages = vec![ChatMessage::user("greet me")];
    let mut deltas = Vec::new();
    orch.run(&mut messages, CancellationToken::new(), |e| {
        if let TurnEvent::TextDelta(d) = e {
            deltas.push(d);
        }
    })
    .await
    .unwrap();

    assert_eq!(deltas, ["Hel", "lo"]);
    let request = &llm.requests()[0];
    assert!(request.stream);
    assert!(request.tools.is_none());
    assert_eq!(messages[1].content, "Hello");
}

#[tokio::test]
async fn model_failure_marks_placeholder_as_error() {
    let (_host, registry) = start_registry(ScriptedHost::new(), &[]).await;
    let llm = Arc::new(MockLlm::new(vec![Err(ApiError::Server {
        status: 500,
        message: "boom".into(),
    })]));
    let orch = orchestrator(llm, registry);

    let mut messages = vec![ChatMessage::user("hi")];
    let mut events = Vec::new();
    let err = orch
        .run(&mut messages, CancellationToken::new(), |e| events.push(e))
        .await
        .unwrap_err();

    assert!(matches!(err, ConduitError::Api(ApiError::Server { status: 500, .. })));
    assert!(messages[1].is_error);
    assert!(!messages[1].is_streaming);
    assert!(matches!(events.last(), Some(TurnEvent::Error(_))));
}

#[tokio::test]
async fn aborted_model_call_is_not_an_error() {
    let (_host, registry) = start_registry(ScriptedHost::new(), &[]).await;
    let llm = Arc::new(MockLlm::new(vec![Err(ApiError::Aborted)]));
    let orch = orchestrator(llm, registry);

    let mut messages = vec![ChatMessage::user("hi")];
    let outcome = orch
        .run(&mut messages, CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Aborted);
    assert!(!messages[1].is_error);
}
