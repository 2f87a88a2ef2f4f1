//! Chat session controller for llama.cpp-style streaming completion servers.
//!
//! A [`GenerationController`] owns the turn lifecycle of one conversation:
//! it renders the prompt from the session templates, streams the reply
//! through a [`CompletionTransport`] and publishes every change through the
//! shared [`ChatContext`].

pub mod chat;
pub mod config;
pub mod logger;
pub mod models;
pub mod transport;

// Network-free transports for tests and the CLI's --mock mode
#[cfg(any(test, feature = "mock"))]
pub mod chat_mock;

pub use chat::{ChatContext, GenerationController, GenerationFault, SharedChatContext, TurnHandle};
pub use config::{load_config, ChatConfig, ConfigError};
pub use models::{CompletionChunk, Session, Timings, Transcript, TranscriptEntry};
pub use transport::{CompletionRequest, CompletionTransport, LlamaServerTransport, TransportError};
