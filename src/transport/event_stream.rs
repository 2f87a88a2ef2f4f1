// Line decoder for the server's `text/event-stream` completion body

use lazy_static::lazy_static;
use regex::Regex;

use super::TransportError;
use crate::models::CompletionChunk;
use log::{debug, warn};

lazy_static! {
    static ref EVENT_FIELD: Regex =
        Regex::new(r"^(\S+):\s(.*)$").expect("event field pattern is valid");
}

/// Turns raw body bytes into chunks.
///
/// Reads can split anywhere, including inside a UTF-8 sequence, so bytes are
/// held until a full line is available.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    pending: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read and collect every event completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<CompletionChunk, TransportError>> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = decode_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes received after the last newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(line: &str) -> Option<Result<CompletionChunk, TransportError>> {
    let caps = EVENT_FIELD.captures(line)?;
    let value = &caps[2];
    match &caps[1] {
        "data" => Some(serde_json::from_str::<CompletionChunk>(value).map_err(TransportError::from)),
        "error" => {
            warn!("Completion server reported an error: {value}");
            Some(Err(TransportError::Server(server_error_message(value))))
        }
        field => {
            debug!("Ignoring event-stream field '{field}'");
            None
        }
    }
}

// Error events carry JSON like {"code":500,"message":"...","type":"..."}
fn server_error_message(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}
