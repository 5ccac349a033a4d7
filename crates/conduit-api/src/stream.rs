//! Text deltas as an async stream.

use crate::decoder::StreamDecoder;
use crate::extract::TextExtractor;
use conduit_types::ApiError;
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// A lazy, finite sequence of non-empty text deltas decoded from a
    /// streamed HTTP body. It cannot be restarted.
    pub struct TextDeltaStream {
        #[pin]
        inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
        decoder: StreamDecoder,
        pending: VecDeque<String>,
        finished: bool,
    }
}

impl TextDeltaStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        extractor: TextExtractor,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: StreamDecoder::new(extractor),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Everything yielded so far, concatenated.
    pub fn text(&self) -> &str {
        self.decoder.text()
    }
}

impl Stream for TextDeltaStream {
    type Item = Result<String, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(delta) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(delta)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.pending.extend(this.decoder.push(&bytes));
                    if this.decoder.is_done() {
                        *this.finished = true;
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(ApiError::Network(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.pending.extend(this.decoder.finish());
                    *this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
