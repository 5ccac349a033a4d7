//! The tool-call loop for one user turn.
//!
//! Each iteration sends the conversation to the model. When the reply asks
//! for tools, every call is routed to the connected server that offers it,
//! its result is appended as a `tool` message, and the model is asked again.
//! The loop ends when the model answers without tool calls, when cancellation
//! is observed, or after [`MAX_TOOL_ITERATIONS`] model calls.

use conduit_mcp::{ServerRegistry, ToolCallResult};
use conduit_types::provider::LlmService;
use conduit_types::{
    ApiError, ChatMessage, ChatRequest, ConduitError, ToolCall, ToolCallRecord, ToolCallStatus,
    truncate_str,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upper bound on model calls per turn.
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// Sampling settings sent with every model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 4096,
            top_p: 1.0,
        }
    }
}

/// Progress reported while a turn runs.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Streamed assistant text.
    TextDelta(String),
    /// A tool call changed status. Carries a snapshot of the call.
    ToolCallStatus(ToolCallRecord),
    /// The model answered without requesting tools.
    Done,
    /// The turn was cancelled.
    Aborted,
    IterationLimitReached,
    Error(String),
}

/// How a turn ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
    IterationLimit,
}

/// Drives the model/tool loop against a set of tool servers.
pub struct Orchestrator {
    llm: Arc<dyn LlmService>,
    registry: Arc<ServerRegistry>,
    settings: ModelSettings,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmService>,
        registry: Arc<ServerRegistry>,
        settings: ModelSettings,
    ) -> Self {
        Self {
            llm,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Run one turn over `messages`.
    ///
    /// If the last message is not an assistant placeholder one is appended;
    /// model output lands in it. Tool results are appended as `tool`
    /// messages in call order, each round followed by a fresh placeholder.
    /// Cancellation yields `Ok(TurnOutcome::Aborted)`; only a failed model
    /// call is an `Err`.
    pub async fn run<F>(
        &self,
        messages: &mut Vec<ChatMessage>,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<TurnOutcome, ConduitError>
    where
        F: FnMut(TurnEvent) + Send,
    {
        if !messages.last().is_some_and(ChatMessage::is_placeholder) {
            messages.push(ChatMessage::assistant_placeholder());
        }

        for iteration in 0..MAX_TOOL_ITERATIONS {
            let slot = messages.len() - 1;
            if cancel.is_cancelled() {
                return Ok(abort(&mut messages[slot], &mut on_event));
            }

            let tools = self.registry.tool_definitions();
            let offers_tools = !tools.is_empty();
            let request = ChatRequest {
                model: self.settings.model.clone(),
                messages: messages[..slot].to_vec(),
                system_prompt: self.settings.system_prompt.clone(),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
                top_p: self.settings.top_p,
                tools: offers_tools.then_some(tools),
                stream: !offers_tools,
            };
            tracing::debug!(
                "Model call {} of {MAX_TOOL_ITERATIONS} via {} ({} messages, streaming: {})",
                iteration + 1,
                self.llm.name(),
                request.messages.len(),
                request.stream,
            );

            let result = {
                let mut forward = |delta: &str| on_event(TurnEvent::TextDelta(delta.to_string()));
                let on_chunk: Option<&mut (dyn FnMut(&str) + Send)> =
                    if request.stream { Some(&mut forward) } else { None };
                self.llm.send(&request, on_chunk, &cancel).await
            };

            let response = match result {
                Ok(response) => response,
                Err(ApiError::Aborted) => return Ok(abort(&mut messages[slot], &mut on_event)),
                Err(e) => {
                    let placeholder = &mut messages[slot];
                    placeholder.is_streaming = false;
                    placeholder.is_error = true;
                    if placeholder.content.is_empty() {
                        placeholder.content = e.to_string();
                    }
                    on_event(TurnEvent::Error(e.to_string()));
                    return Err(ConduitError::Api(e));
                }
            };

            if !request.stream && !response.content.is_empty() {
                on_event(TurnEvent::TextDelta(response.content.clone()));
            }

            let placeholder = &mut messages[slot];
            placeholder.content = response.content;
            placeholder.is_streaming = false;

            if response.tool_calls.is_empty() {
                on_event(TurnEvent::Done);
                return Ok(TurnOutcome::Completed);
            }

            let results = self
                .execute_tools(&mut messages[slot], response.tool_calls, &cancel, &mut on_event)
                .await;
            let aborted = cancel.is_cancelled();
            messages.extend(results);
            if aborted {
                on_event(TurnEvent::Aborted);
                return Ok(TurnOutcome::Aborted);
            }
            messages.push(ChatMessage::assistant_placeholder());
        }

        tracing::warn!("Tool loop stopped after {MAX_TOOL_ITERATIONS} model calls");
        if let Some(last) = messages.last_mut() {
            last.is_streaming = false;
        }
        on_event(TurnEvent::IterationLimitReached);
        Ok(TurnOutcome::IterationLimit)
    }

    /// Run `calls` in order, recording progress on `assistant`, and return one
    /// tool message per call. Calls not started before cancellation are
    /// closed as errors.
    async fn execute_tools<F>(
        &self,
        assistant: &mut ChatMessage,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Vec<ChatMessage>
    where
        F: FnMut(TurnEvent) + Send,
    {
        assistant.tool_calls = calls.into_iter().map(ToolCallRecord::pending).collect();
        for record in &assistant.tool_calls {
            on_event(TurnEvent::ToolCallStatus(record.clone()));
        }

        let mut results = Vec::with_capacity(assistant.tool_calls.len());
        for record in assistant.tool_calls.iter_mut() {
            let outcome = if cancel.is_cancelled() {
                ToolCallResult::error("Cancelled")
            } else {
                record.status = ToolCallStatus::Executing;
                on_event(TurnEvent::ToolCallStatus(record.clone()));
                self.call_tool(&record.call, cancel).await
            };

            let text = outcome.render_text();
            tracing::debug!(
                "Tool {} -> {}{}",
                record.call.name,
                if outcome.is_error { "error: " } else { "" },
                truncate_str(&text, 200),
            );
            record.status = if outcome.is_error {
                ToolCallStatus::Error
            } else {
                ToolCallStatus::Success
            };
            record.result = Some(text.clone());
            on_event(TurnEvent::ToolCallStatus(record.clone()));
            results.push(ChatMessage::tool_result(&record.call.id, text, outcome.is_error));
        }
        results
    }

    /// Route one call to the server offering it. Failures become error results.
    async fn call_tool(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolCallResult {
        let Some(server_id) = self.registry.find_tool_server(&call.name) else {
            return ToolCallResult::error(format!(
                "Tool '{}' is not provided by any connected server",
                call.name
            ));
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return ToolCallResult::error("Cancelled"),
            result = self.registry.call_tool(&server_id, &call.name, call.arguments.clone()) => result,
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("Tool {} on {server_id} failed: {e}", call.name);
            ToolCallResult::error(e.to_string())
        })
    }
}

fn abort<F: FnMut(TurnEvent)>(placeholder: &mut ChatMessage, on_event: &mut F) -> TurnOutcome {
    placeholder.is_streaming = false;
    placeholder.is_error = false;
    on_event(TurnEvent::Aborted);
    TurnOutcome::Aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_mcp::McpConfig;
    use conduit_types::ChatResponse;
    use std::future::Future;
    use std::pin::Pin;

    struct Fixed(ChatResponse);

    impl LlmService for Fixed {
        fn send<'a>(
            &'a self,
            _request: &'a ChatRequest,
            _on_chunk: Option<conduit_types::provider::ChunkCallback<'a>>,
            _cancel: &'a CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, ApiError>> + Send + 'a>> {
            let response = self.0.clone();
            Box::pin(async move { Ok(response) })
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn orchestrator(response: ChatResponse) -> Orchestrator {
        Orchestrator::new(
            Arc::new(Fixed(response)),
            Arc::new(ServerRegistry::new(&McpConfig::default())),
            ModelSettings::default(),
        )
    }

    #[test]
    fn default_settings() {
        let settings = ModelSettings::default();
        assert_eq!(settings.max_tokens, 4096);
        assert!((settings.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn plain_reply_fills_placeholder() {
        let orch = orchestrator(ChatResponse::text("hello"));
        let mut messages = vec![ChatMessage::user("hi")];
        let outcome = orch
            .run(&mut messages, CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "hello");
        assert!(!messages[1].is_streaming);
    }

    #[tokio::test]
    async fn existing_placeholder_is_reused() {
        let orch = orchestrator(ChatResponse::text("ok"));
        let mut messages = vec![ChatMessage::user("hi"), ChatMessage::assistant_placeholder()];
        orch.run(&mut messages, CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "ok");
    }

    #[tokio::test]
    async fn cancelled_before_first_call() {
        let orch = orchestrator(ChatResponse::text("unused"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut messages = vec![ChatMessage::user("hi")];
        let mut events = Vec::new();
        let outcome = orch
            .run(&mut messages, cancel, |e| events.push(e))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Aborted);
        assert!(matches!(events.as_slice(), [TurnEvent::Aborted]));
        assert!(!messages[1].is_streaming);
        assert!(!messages[1].is_error);
        assert!(messages[1].content.is_empty());
    }
}
