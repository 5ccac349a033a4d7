//! Per-provider extraction of the text delta from one streamed JSON payload.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Pulls the text delta out of a decoded `data:` payload.
#[derive(Clone)]
pub enum TextExtractor {
    /// `candidates[0].content.parts[0].text`
    Google,
    /// `choices[0].delta.content` (OpenAI, Groq and compatible APIs).
    OpenAi,
    Custom(Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>),
}

impl TextExtractor {
    pub fn custom(f: impl Fn(&Value) -> Option<String> + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Look up a built-in extractor by provider name.
    pub fn for_provider(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "google" | "gemini" => Some(Self::Google),
            "openai" | "groq" => Some(Self::OpenAi),
            _ => None,
        }
    }

    /// The text carried by `payload`, if any.
    pub fn extract(&self, payload: &Value) -> Option<String> {
        match self {
            Self::Google => payload
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .map(str::to_string),
            Self::OpenAi => payload
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .map(str::to_string),
            Self::Custom(f) => f(payload),
        }
    }
}

impl fmt::Debug for TextExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Google => f.write_str("Google"),
            Self::OpenAi => f.write_str("OpenAi"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
