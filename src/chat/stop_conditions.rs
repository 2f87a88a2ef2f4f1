// Stop sequences sent along with every completion request

use super::templates::{render, SettingsProvider, TemplateError};

/// End-of-sequence marker most llama models emit at the end of a turn.
pub const END_OF_TURN_MARKER: &str = "</s>";

/// Stop sequences for one turn.
///
/// Besides the end-of-turn marker, the server is told to stop as soon as
/// the model starts a line for either participant, so it never writes the
/// user's next message itself.
pub fn stop_sequences<P: SettingsProvider + ?Sized>(
    settings: &P,
) -> Result<Vec<String>, TemplateError> {
    Ok(vec![
        END_OF_TURN_MARKER.to_string(),
        render("{{char}}:", settings)?,
        render("{{user}}:", settings)?,
    ])
}
