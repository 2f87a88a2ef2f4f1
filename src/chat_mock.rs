// Transports that never touch the network: scripted ones for tests and a
// canned-reply one for running the CLI without a llama.cpp server.

use async_stream::stream;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{CompletionChunk, Timings};
use crate::transport::{ChunkStream, CompletionRequest, CompletionTransport, TransportError};
use log::{debug, info};

pub type ScriptSender = mpsc::UnboundedSender<Result<CompletionChunk, TransportError>>;
type ScriptReceiver = mpsc::UnboundedReceiver<Result<CompletionChunk, TransportError>>;

/// Transport driven chunk by chunk from the test.
///
/// Each `stream_completion` call takes the oldest script registered with
/// [`ScriptedTransport::script_turn`]. The stream yields whatever is sent
/// on that script and ends when the sender is dropped.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<ScriptReceiver>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_turn(&self) -> ScriptSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(rx);
        tx
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CompletionTransport for ScriptedTransport {
    fn stream_completion(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        Box::pin(stream! {
            let Some(mut script) = script else {
                yield Err(TransportError::Unavailable("no scripted turn left".to_string()));
                return;
            };
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    item = script.recv() => item,
                };
                match item {
                    Some(Ok(chunk)) => yield Ok(chunk),
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => return,
                }
            }
        })
    }
}

/// Streams canned replies word by word, like a slow local model would.
#[derive(Debug, Clone)]
pub struct MockTransport {
    token_delay: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(60))
    }
}

impl MockTransport {
    pub fn new(token_delay: Duration) -> Self {
        info!("Mock transport initialized ({}ms per token)", token_delay.as_millis());
        Self { token_delay }
    }
}

// The prompt ends with the character cue; the line before it is the user's.
fn latest_user_line(request: &CompletionRequest) -> &str {
    let cue = request.stop.get(1).map(String::as_str).unwrap_or_default();
    let body = request.prompt.trim_end();
    let body = body.strip_suffix(cue).unwrap_or(body);
    body.trim_end().lines().last().unwrap_or_default()
}

fn canned_reply(user_line: &str) -> &'static str {
    let lowered = user_line.to_lowercase();
    let has_word = |word: &str| {
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|w| w == word)
    };
    if has_word("hello") || has_word("hi") {
        "Hello! I'm a mock assistant. How can I help you today?"
    } else if has_word("help") {
        "I'm running in mock mode, so every answer is canned. Start a llama.cpp server and drop --mock for real replies."
    } else {
        "This is a mock response. No completion server was contacted."
    }
}

impl CompletionTransport for MockTransport {
    fn stream_completion(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream {
        let reply = canned_reply(latest_user_line(&request));
        let delay = self.token_delay;
        let per_token_ms = delay.as_millis() as f64;
        let timings = Timings {
            predicted_per_token_ms: per_token_ms,
            predicted_per_second: if per_token_ms > 0.0 { 1000.0 / per_token_ms } else { 0.0 },
        };
        debug!("Mock reply: {reply}");

        Box::pin(stream! {
            let words: Vec<&str> = reply.split_inclusive(' ').collect();
            let count = words.len();
            for (i, word) in words.into_iter().enumerate() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                // Leading space mimics how tokenizers emit words.
                let piece = if i == 0 { format!(" {word}") } else { word.to_string() };
                if i + 1 == count {
                    yield Ok(CompletionChunk::last(piece, Some(timings)));
                } else {
                    yield Ok(CompletionChunk::text(piece));
                }
            }
        })
    }
}
