//! Byte fragment sources feeding the stream controller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use postgen_core::error::{Result, TransportError};

/// Raw body fragments of one open response, in arrival order.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next fragment, or `None` once the body is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Body of a streaming `reqwest` response.
pub struct ResponseSource {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
}

impl ResponseSource {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
        }
    }
}

#[async_trait]
impl ChunkSource for ResponseSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.stream.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(TransportError::Read(e.to_string()).into()),
            None => Ok(None),
        }
    }
}

/// Replays a captured body from memory, optionally ending in a read failure.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: VecDeque<std::result::Result<Bytes, String>>,
    reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(|c| Ok(c.into())).collect(),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cut `body` into fragments of at most `size` bytes.
    pub fn from_body(body: impl Into<Bytes>, size: usize) -> Self {
        let mut body: Bytes = body.into();
        let size = size.max(1);
        let mut chunks = Vec::new();
        while !body.is_empty() {
            let n = size.min(body.len());
            chunks.push(body.split_to(n));
        }
        Self::new(chunks)
    }

    /// Fail with a read error once the queued fragments are used up.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.chunks.push_back(Err(message.into()));
        self
    }

    /// Shared count of `next_chunk` calls, readable after the source is moved.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.chunks.pop_front() {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(message)) => Err(TransportError::Read(message).into()),
            None => Ok(None),
        }
    }
}
