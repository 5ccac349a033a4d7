//! HTTP behaviour of `HttpChatBackend` against a raw TCP test server:
//! retry on transient statuses, streamed and unstreamed replies, both wire
//! formats, and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_api::{HttpChatBackend, RetryConfig, StreamClient, TextExtractor, WireFormat};
use conduit_types::provider::LlmService;
use conduit_types::{ApiError, ChatMessage, ChatRequest, ToolDefinition};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const OPENAI_SSE_BODY: &str = "\
data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Retried\"}}]}\n\
\n\
data: {\"choices\":[{\"delta\":{\"content\":\" OK\"}}]}\n\
\n\
data: [DONE]\n\
\n";

const GOOGLE_SSE_BODY: &str = "\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Bonjour\"}]}}]}\r\n\
\r\n\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" monde\"}]}}]}\r\n\
\r\n";

fn http_response(status: &str, content_type: &str, extra: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         {extra}\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    )
}

fn sse_ok(body: &str) -> String {
    http_response("200 OK", "text/event-stream", "", body)
}

fn json_ok(body: &str) -> String {
    http_response("200 OK", "application/json", "", body)
}

fn rate_limited() -> String {
    http_response(
        "429 Too Many Requests",
        "application/json",
        "Retry-After: 0.01\r\n",
        r#"{"error":{"message":"rate limited"}}"#,
    )
}

fn server_error() -> String {
    http_response(
        "500 Internal Server Error",
        "application/json",
        "",
        r#"{"error":{"message":"internal error"}}"#,
    )
}

fn unauthorized() -> String {
    http_response(
        "401 Unauthorized",
        "application/json",
        "",
        r#"{"error":{"message":"invalid api key"}}"#,
    )
}

/// Read one request (head plus `Content-Length` body) as text.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let length = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= head_end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

struct TestServer {
    base_url: String,
    counter: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    fn request(&self, idx: usize) -> String {
        self.requests.lock().unwrap()[idx].clone()
    }
}

/// One canned response per incoming connection, in order. Connections past
/// the end of `responses` are held open without a reply.
async fn start_test_server(responses: Vec<String>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(responses);

    let (counter_task, requests_task) = (Arc::clone(&counter), Arc::clone(&requests));
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let idx = counter_task.fetch_add(1, Ordering::SeqCst);
            let responses = Arc::clone(&responses);
            let requests = Arc::clone(&requests_task);
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                requests.lock().unwrap().push(request);
                match responses.get(idx) {
                    Some(response) => {
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.flush().await;
                        let _ = socket.shutdown().await;
                    }
                    None => tokio::time::sleep(Duration::from_secs(30)).await,
                }
            });
        }
    });

    TestServer {
        base_url: format!("http://{addr}"),
        counter,
        requests,
    }
}

fn backend(format: WireFormat, base_url: &str) -> HttpChatBackend {
    HttpChatBackend::new(format, base_url, "test-key")
        .unwrap()
        .with_retry_config(RetryConfig {
            max_retries: 2,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_factor: 2.0,
        })
}

fn chat_request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.into(),
        messages: vec![ChatMessage::user("test")],
        system_prompt: None,
        temperature: 0.2,
        max_tokens: 100,
        top_p: 1.0,
        tools: None,
        stream: true,
    }
}

#[tokio::test]
async fn retries_429_then_streams() {
    let server = start_test_server(vec![rate_limited(), sse_ok(OPENAI_SSE_BODY)]).await;
    let backend = backend(WireFormat::OpenAi, &server.base_url);

    let mut chunks = Vec::new();
    let mut on_chunk = |c: &str| chunks.push(c.to_string());
    let response = backend
        .send(&chat_request("gpt-test"), Some(&mut on_chunk), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.content, "Retried OK");
    assert!(response.tool_calls.is_empty());
    assert_eq!(chunks, ["Retried", " OK"]);
    assert_eq!(server.count(), 2);

    let request = server.request(1);
    assert!(request.starts_with("POST /chat/completions "));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer test-key"));
    assert!(request.contains(r#""stream":true"#));
}

#[tokio::test]
async fn stream_text_yields_deltas_after_retry() {
    let server = start_test_server(vec![rate_limited(), sse_ok(OPENAI_SSE_BODY)]).await;
    let client = StreamClient::new()
        .unwrap()
        .with_bearer_auth("test-key")
        .unwrap()
        .with_retry_config(RetryConfig {
            max_retries: 1,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_factor: 2.0,
        });

    let url = format!("{}/chat/completions", server.base_url);
    let body = serde_json::json!({"model": "gpt-test", "stream": true});
    let mut stream = client
        .stream_text(&url, &body, TextExtractor::OpenAi, &CancellationToken::new())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    while let Some(delta) = stream.next().await {
        deltas.push(delta.unwrap());
    }
    assert_eq!(deltas, ["Retried", " OK"]);
    assert_eq!(server.count(), 2);
    assert!(server.request(1).contains(r#""model":"gpt-test""#));
}

#[tokio::test]
async fn retries_500_then_succeeds() {
    let server = start_test_server(vec![server_error(), sse_ok(OPENAI_SSE_BODY)]).await;
    let backend = backend(WireFormat::OpenAi, &server.base_url);

    let response = backend
        .send(&chat_request("gpt-test"), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.content, "Retried OK");
    assert_eq!(server.count(), 2);
}

#[tokio::test]
async fn retries_exhausted() {
    let server = start_test_server(vec![rate_limited(), rate_limited(), rate_limited()]).await;
    let backend = backend(WireFormat::OpenAi, &server.base_url);

    let err = backend
        .send(&chat_request("gpt-test"), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::RateLimited { .. }), "got {err:?}");
    assert_eq!(server.count(), 3);
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let server = start_test_server(vec![unauthorized(), sse_ok(OPENAI_SSE_BODY)]).await;
    let backend = backend(WireFormat::OpenAi, &server.base_url);

    let err = backend
        .send(&chat_request("gpt-test"), None, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ApiError::Auth { message } => assert_eq!(message, "invalid api key"),
        other => panic!("expected Auth, got {other:?}"),
    }
    assert_eq!(server.count(), 1);
}

#[tokio::test]
async fn tools_request_is_unstreamed_and_returns_calls() {
    let completion = r#"{"choices":[{"message":{"role":"assistant","content":"","tool_calls":[{"id":"call_1","type":"function","function":{"name":"echo","arguments":"{\"text\":\"hi\"}"}}]},"finish_reason":"tool_calls"}]}"#;
    let server = start_test_server(vec![json_ok(completion)]).await;
    let backend = backend(WireFormat::OpenAi, &server.base_url);

    let mut request = chat_request("gpt-test");
    request.tools = Some(vec![ToolDefinition {
        name: "echo".into(),
        description: "Echo text".into(),
        input_schema: serde_json::json!({"type": "object"}),
    }]);

    let response = backend
        .send(&request, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_1");
    assert_eq!(response.tool_calls[0].arguments, serde_json::json!({"text": "hi"}));

    let sent = server.request(0);
    assert!(sent.contains(r#""stream":false"#));
    assert!(sent.contains(r#""name":"echo""#));
}

#[tokio::test]
async fn google_streams_with_api_key_header() {
    let server = start_test_server(vec![sse_ok(GOOGLE_SSE_BODY)]).await;
    let backend = backend(WireFormat::Google, &server.base_url);

    let response = backend
        .send(&chat_request("gemini-test"), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.content, "Bonjour monde");

    let request = server.request(0);
    assert!(request.starts_with("POST /models/gemini-test:streamGenerateContent?alt=sse "));
    assert!(request.to_ascii_lowercase().contains("x-goog-api-key: test-key"));
    assert!(request.contains(r#""contents""#));
}

#[tokio::test]
async fn cancellation_aborts_pending_request() {
    let server = start_test_server(Vec::new()).await;
    let backend = backend(WireFormat::OpenAi, &server.base_url);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = backend
        .send(&chat_request("gpt-test"), None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Aborted), "got {err:?}");
}
