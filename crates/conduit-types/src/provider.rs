//! The contract every LLM backend fulfils for the orchestrator.

use crate::{ApiError, ChatRequest, ChatResponse};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Receives streamed text deltas.
///
/// Called zero or more times, in arrival order, never with an empty string.
pub type ChunkCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Trait for LLM backends (OpenAI-compatible, Google, ...).
///
/// Backends translate the canonical request into their own wire format. The
/// orchestrator only depends on this shape. Dyn-compatible so it can be held
/// as `Arc<dyn LlmService>`.
pub trait LlmService: Send + Sync {
    /// Send the conversation and return the full reply.
    ///
    /// When `request.stream` is set and `on_chunk` is given, text deltas are
    /// reported as they arrive. A backend that observes `cancel` firing
    /// returns [`ApiError::Aborted`].
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        on_chunk: Option<ChunkCallback<'a>>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, ApiError>> + Send + 'a>>;

    /// Backend name for logging/display (e.g., "openai").
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn llm_service_is_dyn_compatible() {
        fn _accept(_s: &dyn LlmService) {}
    }

    #[test]
    fn arc_llm_service_is_send_sync() {
        fn _assert_send_sync<T: Send + Sync>() {}
        _assert_send_sync::<Arc<dyn LlmService>>();
    }
}
