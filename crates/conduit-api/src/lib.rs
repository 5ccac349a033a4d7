//! Streaming text decoder and HTTP chat backends for Conduit.

mod backend;
mod client;
mod decoder;
mod extract;
mod retry;
mod stream;

pub use backend::{HttpChatBackend, WireFormat};
pub use client::StreamClient;
pub use decoder::{StreamDecoder, decode_stream};
pub use extract::TextExtractor;
pub use retry::RetryConfig;
pub use stream::TextDeltaStream;
