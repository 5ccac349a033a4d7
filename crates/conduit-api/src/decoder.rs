//! Streaming decoder for provider output framed as Server-Sent-Events.
//!
//! Input is `data: <json>` lines terminated by `data: [DONE]`. Chunk
//! boundaries may fall anywhere, including inside a line or a UTF-8
//! sequence; only complete lines are decoded, so the accumulated text does
//! not depend on how the bytes were split.

use crate::extract::TextExtractor;
use bytes::Bytes;
use conduit_types::ApiError;
use conduit_types::provider::ChunkCallback;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

const DONE_SENTINEL: &str = "[DONE]";

/// Incremental line decoder accumulating the full response text.
#[derive(Debug)]
pub struct StreamDecoder {
    extractor: TextExtractor,
    buffer: Vec<u8>,
    text: String,
    done: bool,
}

impl StreamDecoder {
    pub fn new(extractor: TextExtractor) -> Self {
        Self {
            extractor,
            buffer: Vec::new(),
            text: String::new(),
            done: false,
        }
    }

    /// Feed a chunk and return the non-empty text deltas it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(&line[..pos]) {
                deltas.push(delta);
            }
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        deltas
    }

    /// Give any unterminated trailing line one final parse.
    pub fn finish(&mut self) -> Option<String> {
        if self.done || self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest)
    }

    /// True once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        let payload = line.strip_prefix("data:")?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();

        if payload == DONE_SENTINEL {
            self.done = true;
            return None;
        }
        // Malformed payloads are skipped, not fatal.
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let delta = self.extractor.extract(&value).filter(|t| !t.is_empty())?;
        self.text.push_str(&delta);
        Some(delta)
    }
}

/// Drain `stream` through a [`StreamDecoder`], reporting each delta to
/// `on_chunk`, and return the full text.
///
/// Returns [`ApiError::Aborted`] as soon as `cancel` fires.
pub async fn decode_stream<S, E>(
    stream: S,
    extractor: TextExtractor,
    mut on_chunk: Option<ChunkCallback<'_>>,
    cancel: &CancellationToken,
) -> Result<String, ApiError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = StreamDecoder::new(extractor);
    let mut emit = |delta: &str| {
        if let Some(cb) = on_chunk.as_mut() {
            cb(delta);
        }
    };

    while !decoder.is_done() {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Aborted),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for delta in decoder.push(&chunk) {
                    emit(&delta);
                }
            }
            Some(Err(e)) => return Err(ApiError::Network(e.to_string())),
            None => break,
        }
    }
    if let Some(delta) = decoder.finish() {
        emit(&delta);
    }
    Ok(decoder.into_text())
}
