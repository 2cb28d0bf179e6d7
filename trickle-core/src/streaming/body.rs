//! Response body that keeps its stream alive while bytes flow

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream as FuturesStream, StreamExt};
use tracing::error;

use super::StreamingError;
use super::registry::Stream;
use crate::engine::BlockStream;

/// Pull-driven byte stream over one engine range read.
///
/// Blocks are only requested from the engine when the consumer polls, so a
/// slow client naturally throttles the read. Every delivered block refreshes
/// the owning stream's idle deadline. Dropping the body cancels the engine
/// read; the stream itself is left to its idle timeout so a client that
/// reconnects for the next window keeps it.
pub struct StreamBody {
    blocks: BlockStream,
    stream: Arc<Stream>,
    delivered: u64,
    finished: bool,
}

impl StreamBody {
    pub fn new(blocks: BlockStream, stream: Arc<Stream>) -> Self {
        Self {
            blocks,
            stream,
            delivered: 0,
            finished: false,
        }
    }

    /// The stream this body keeps alive.
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Bytes handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl FuturesStream for StreamBody {
    type Item = Result<Bytes, StreamingError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.blocks.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(block))) => {
                self.stream.refresh();
                self.delivered += block.len() as u64;
                Poll::Ready(Some(Ok(block)))
            }
            Poll::Ready(Some(Err(e))) => {
                error!(
                    "Stream {} failed after {} bytes: {}",
                    self.stream.id(),
                    self.delivered,
                    e
                );
                self.finished = true;
                Poll::Ready(Some(Err(StreamingError::ReadFailure {
                    reason: e.to_string(),
                })))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
