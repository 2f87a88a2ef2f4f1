//! Last-known generation speed, as reported by the completion server.

use std::fmt;
use tokio::sync::watch;

use crate::models::Timings;

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0}ms per token, {:.2} tokens per second",
            round_half_up(self.predicted_per_token_ms, 0),
            round_half_up(self.predicted_per_second, 2)
        )
    }
}

// Formatting alone rounds ties to even; the status line rounds them away from zero.
fn round_half_up(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Holds the most recent timing sample. Samples overwrite each other.
#[derive(Debug)]
pub struct TelemetrySink {
    latest: watch::Sender<Option<Timings>>,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self { latest }
    }

    pub fn observe_timing(&self, sample: Timings) {
        self.latest.send_replace(Some(sample));
    }

    pub fn current_timing(&self) -> Option<Timings> {
        *self.latest.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Timings>> {
        self.latest.subscribe()
    }
}
