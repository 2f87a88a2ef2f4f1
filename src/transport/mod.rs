//! Streaming completion boundary.
//!
//! The controller only sees a [`CompletionTransport`]: give it a request and
//! a cancellation token, get back a finite stream of chunks. Cancelling the
//! token ends the stream without an error item.

mod event_stream;
mod llama_server;

pub use event_stream::EventStreamDecoder;
pub use llama_server::LlamaServerTransport;

use futures_util::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::chat::sampler::SamplingParams;
use crate::models::CompletionChunk;

/// Everything the server needs for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub params: SamplingParams,
    pub stop: Vec<String>,
}

impl CompletionRequest {
    pub fn to_payload(&self) -> serde_json::Value {
        self.params.to_payload(&self.prompt, &self.stop)
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, TransportError>> + Send>>;

pub trait CompletionTransport: Send + Sync {
    /// Open one streaming completion. The stream is lazy: nothing is sent
    /// until it is first polled.
    fn stream_completion(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("connection error: {0}")]
    Http(#[from] hyper::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed chunk: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
