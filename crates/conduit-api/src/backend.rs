//! [`LlmService`] over HTTP for OpenAI-compatible and Google endpoints.
//!
//! Text is streamed through the [`StreamDecoder`](crate::StreamDecoder).
//! Requests that offer tools are sent unstreamed so structured tool calls
//! arrive whole; only the OpenAI-compatible format decodes them.

use crate::client::StreamClient;
use crate::extract::TextExtractor;
use crate::retry::RetryConfig;
use conduit_types::provider::{ChunkCallback, LlmService};
use conduit_types::{ApiError, ChatMessage, ChatRequest, ChatResponse, Role, ToolCall};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Request/response shape spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAi,
    Google,
}

impl WireFormat {
    pub fn extractor(self) -> TextExtractor {
        match self {
            Self::OpenAi => TextExtractor::OpenAi,
            Self::Google => TextExtractor::Google,
        }
    }
}

/// Chat backend reached over HTTP.
#[derive(Clone)]
pub struct HttpChatBackend {
    client: StreamClient,
    base_url: String,
    format: WireFormat,
}

impl HttpChatBackend {
    pub fn new(
        format: WireFormat,
        base_url: impl Into<String>,
        api_key: &str,
    ) -> Result<Self, ApiError> {
        let client = StreamClient::new()?;
        let client = match format {
            WireFormat::OpenAi => client.with_bearer_auth(api_key)?,
            WireFormat::Google => client.with_header("x-goog-api-key", api_key)?,
        };
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            format,
        })
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.client = self.client.with_retry_config(config);
        self
    }

    fn url(&self, model: &str, stream: bool) -> String {
        match self.format {
            WireFormat::OpenAi => format!("{}/chat/completions", self.base_url),
            WireFormat::Google if stream => {
                format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url)
            }
            WireFormat::Google => format!("{}/models/{model}:generateContent", self.base_url),
        }
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        match self.format {
            WireFormat::OpenAi => openai_body(request, stream),
            WireFormat::Google => google_body(request),
        }
    }
}

fn openai_message(message: &ChatMessage) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|record| {
                    json!({
                        "id": record.call.id,
                        "type": "function",
                        "function": {
                            "name": record.call.name,
                            "arguments": record.call.arguments.to_string(),
                        }
                    })
                })
                .collect();
            json!({"role": "assistant", "content": message.content, "tool_calls": calls})
        }
        role => json!({"role": role, "content": message.content}),
    }
}

fn openai_body(request: &ChatRequest, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system_prompt {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.extend(request.messages.iter().map(openai_message));

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "top_p": request.top_p,
        "stream": stream,
    });
    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
    }
    body
}

fn google_body(request: &ChatRequest) -> Value {
    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": request.temperature,
            "maxOutputTokens": request.max_tokens,
            "topP": request.top_p,
        }
    });
    if let Some(system) = &request.system_prompt {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    body
}

/// Decode an unstreamed OpenAI-compatible completion.
fn parse_openai_completion(value: &Value) -> Result<ChatResponse, ApiError> {
    let choice = value
        .pointer("/choices/0")
        .ok_or_else(|| ApiError::StreamParse("completion has no choices".into()))?;
    let message = &choice["message"];

    let mut tool_calls = Vec::new();
    for call in message["tool_calls"].as_array().into_iter().flatten() {
        let raw = call["function"]["arguments"].as_str().unwrap_or("{}");
        let arguments = serde_json::from_str(raw).unwrap_or_else(|_| json!({}));
        tool_calls.push(ToolCall {
            id: call["id"].as_str().unwrap_or_default().to_string(),
            name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
            arguments,
        });
    }

    Ok(ChatResponse {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
    })
}

impl LlmService for HttpChatBackend {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        on_chunk: Option<ChunkCallback<'a>>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, ApiError>> + Send + 'a>> {
        Box::pin(async move {
            let offers_tools = request.tools.as_ref().is_some_and(|t| !t.is_empty());
            let stream = request.stream && !offers_tools;
            let url = self.url(&request.model, stream);
            let body = self.body(request, stream);

            if stream {
                let content = self
                    .client
                    .complete_text(&url, &body, self.format.extractor(), on_chunk, cancel)
                    .await?;
                return Ok(ChatResponse {
                    content,
                    tool_calls: Vec::new(),
                    finish_reason: Some("stop".into()),
                });
            }

            let value = self.client.post_json(&url, &body, cancel).await?;
            match self.format {
                WireFormat::OpenAi => parse_openai_completion(&value),
                WireFormat::Google => Ok(ChatResponse::text(
                    self.format.extractor().extract(&value).unwrap_or_default(),
                )),
            }
        })
    }

    fn name(&self) -> &str {
        match self.format {
            WireFormat::OpenAi => "openai",
            WireFormat::Google => "google",
        }
    }
}
