//! Server-Sent Events (SSE) block parser.
//!
//! Parses text from a long-lived HTTP response into SSE events according to
//! the W3C EventSource specification. Events are separated by a blank line.

/// A single SSE event parsed from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The event name, defaulting to `message` as EventSource does.
    pub fn name(&self) -> &str {
        self.event_type.as_deref().unwrap_or("message")
    }
}

/// Incremental SSE parser that turns text chunks into events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    /// Trailing bytes of a codepoint split across network chunks.
    partial_utf8: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the network and return any complete events.
    ///
    /// A multi-byte character split across chunks is held back until the
    /// rest of it arrives.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial_utf8.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.partial_utf8) {
            Ok(_) => self.partial_utf8.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Genuinely invalid bytes: decode lossily rather than stall.
            Err(_) => self.partial_utf8.len(),
        };
        let rest = self.partial_utf8.split_off(valid);
        let text = String::from_utf8_lossy(&self.partial_utf8).into_owned();
        self.partial_utf8 = rest;
        self.feed(&text)
    }

    /// Feed a chunk of text and return any complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n").replace('\r', "\n"));
        } else {
            self.buffer.push_str(chunk);
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Parse a single SSE block (lines between blank lines) into an event.
    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }

            if let Some((field, value)) = line.split_once(':') {
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => event_type = Some(value.to_string()),
                    "data" => data_lines.push(value.to_string()),
                    _ => {}
                }
            } else if line == "data" {
                data_lines.push(String::new());
            }
        }

        if data_lines.is_empty() {
            return None;
        }

        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}
