use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;

use crate::chat::templates::SettingsProvider;

/// Speaker placeholder for messages typed by the user.
pub const USER_SPEAKER_KEY: &str = "{{user}}";
/// Speaker placeholder for messages produced by the model.
pub const CHAR_SPEAKER_KEY: &str = "{{char}}";

/// One line of conversation history.
///
/// `speaker` is a placeholder (`{{user}}` / `{{char}}`) rather than a
/// display name, so renaming a participant rewrites the whole history
/// the next time it is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: String,
    pub message: String,
}

impl TranscriptEntry {
    pub fn new(speaker: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(USER_SPEAKER_KEY, message)
    }

    pub fn character(message: impl Into<String>) -> Self {
        Self::new(CHAR_SPEAKER_KEY, message)
    }
}

/// Immutable transcript snapshot. Every change builds a new slice.
pub type Transcript = Arc<[TranscriptEntry]>;

/// Build a new transcript from `prior` with `entry` appended.
pub fn transcript_with(prior: &[TranscriptEntry], entry: TranscriptEntry) -> Transcript {
    let mut entries = Vec::with_capacity(prior.len() + 1);
    entries.extend_from_slice(prior);
    entries.push(entry);
    entries.into()
}

pub fn empty_transcript() -> Transcript {
    Arc::from(Vec::new())
}

// Session configuration and history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_history_template", rename = "historyTemplate")]
    pub history_template: String,
    #[serde(default = "default_kind", rename = "type")]
    pub kind: String,
    #[serde(default = "default_char")]
    pub char: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(skip, default = "empty_transcript")]
    pub transcript: Transcript,
}

fn default_prompt() -> String {
    "This is a conversation between user and Yoav, a chatbot. respond in simple markdown."
        .to_string()
}

// History holds prior turns only, so the current message is spelled out here.
fn default_template() -> String {
    "{{prompt}}\n\n{{history}}\n{{user}}: {{message}}\n{{char}}:".to_string()
}

fn default_history_template() -> String {
    "{{name}}: {{message}}".to_string()
}

fn default_kind() -> String {
    "chat".to_string()
}

fn default_char() -> String {
    "Yoav".to_string()
}

fn default_user() -> String {
    "User".to_string()
}

impl Default for Session {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            template: default_template(),
            history_template: default_history_template(),
            kind: default_kind(),
            char: default_char(),
            user: default_user(),
            transcript: empty_transcript(),
        }
    }
}

impl Session {
    /// Settings keys accepted by [`Session::set_field`].
    pub const FIELDS: &'static [&'static str] =
        &["prompt", "template", "historyTemplate", "type", "char", "user"];

    /// Whether any message has been exchanged yet.
    pub fn chat_started(&self) -> bool {
        !self.transcript.is_empty()
    }

    /// Replace one configuration field by its settings key.
    pub fn set_field(&mut self, name: &str, value: impl Into<String>) -> Result<(), SettingsError> {
        let slot = match name {
            "prompt" => &mut self.prompt,
            "template" => &mut self.template,
            "historyTemplate" => &mut self.history_template,
            "type" => &mut self.kind,
            "char" => &mut self.char,
            "user" => &mut self.user,
            _ => return Err(SettingsError::UnknownField(name.to_string())),
        };
        *slot = value.into();
        Ok(())
    }
}

impl SettingsProvider for Session {
    fn lookup(&self, key: &str) -> Option<Cow<'_, str>> {
        let value = match key {
            "prompt" => &self.prompt,
            "template" => &self.template,
            "historyTemplate" => &self.history_template,
            "type" => &self.kind,
            "char" => &self.char,
            "user" => &self.user,
            _ => return None,
        };
        Some(Cow::Borrowed(value.as_str()))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown session field '{0}'")]
    UnknownField(String),
}

/// Generation speed reported by the server alongside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

/// One incremental unit of a streaming completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
}

impl CompletionChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn last(content: impl Into<String>, timings: Option<Timings>) -> Self {
        Self {
            content: content.into(),
            stop: true,
            timings,
        }
    }
}
