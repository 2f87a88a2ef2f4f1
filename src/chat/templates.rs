use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;

use crate::models::{Session, TranscriptEntry};
use log::debug;

/// Deepest chain of placeholder-inside-placeholder expansions allowed.
pub const MAX_TEMPLATE_DEPTH: usize = 32;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern is valid");
}

/// Key/value source that `{{key}}` placeholders are resolved against.
pub trait SettingsProvider {
    fn lookup(&self, key: &str) -> Option<Cow<'_, str>>;
}

impl SettingsProvider for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).map(|v| Cow::Borrowed(v.as_str()))
    }
}

impl<P: SettingsProvider + ?Sized> SettingsProvider for &P {
    fn lookup(&self, key: &str) -> Option<Cow<'_, str>> {
        (**self).lookup(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template recursion limit ({depth}) exceeded while expanding '{{{{{key}}}}}'")]
    RecursionLimit { key: String, depth: usize },
}

/// Render `template` against `settings`.
///
/// Unknown keys render as the empty string. Resolved values are rendered
/// again, so settings may reference each other.
pub fn render<P: SettingsProvider + ?Sized>(
    template: &str,
    settings: &P,
) -> Result<String, TemplateError> {
    render_with(template, settings, &[])
}

/// Render `template` with `overrides` layered over `settings`.
///
/// Overrides only apply to placeholders in `template` itself; values pulled
/// in by a lookup are expanded against `settings` alone.
pub fn render_with<P: SettingsProvider + ?Sized>(
    template: &str,
    settings: &P,
    overrides: &[(&str, &str)],
) -> Result<String, TemplateError> {
    expand(template, 0, &|key: &str| {
        overrides
            .iter()
            .rev()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| Cow::Borrowed(*value))
            .or_else(|| settings.lookup(key))
    }, settings)
}

fn expand<'s, P: SettingsProvider + ?Sized>(
    template: &str,
    depth: usize,
    lookup: &dyn Fn(&str) -> Option<Cow<'s, str>>,
    settings: &'s P,
) -> Result<String, TemplateError> {
    let mut failure = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        if failure.is_some() {
            return String::new();
        }
        let key = &caps[1];
        let Some(value) = lookup(key) else {
            return String::new();
        };
        if depth >= MAX_TEMPLATE_DEPTH {
            failure = Some(TemplateError::RecursionLimit {
                key: key.to_string(),
                depth: MAX_TEMPLATE_DEPTH,
            });
            return String::new();
        }
        match expand(&value, depth + 1, &|k: &str| settings.lookup(k), settings) {
            Ok(nested) => nested,
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    });

    match failure {
        Some(e) => {
            debug!("Template expansion aborted: {e}");
            Err(e)
        }
        None => Ok(rendered.into_owned()),
    }
}

/// Render every transcript entry through the session's history template,
/// one line per entry.
pub fn render_history(
    session: &Session,
    transcript: &[TranscriptEntry],
) -> Result<String, TemplateError> {
    let lines = transcript
        .iter()
        .map(|entry| {
            render_with(
                &session.history_template,
                session,
                &[("name", entry.speaker.as_str()), ("message", entry.message.as_str())],
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

/// Speaker names and messages of the session transcript, resolved for display.
pub fn display_transcript(session: &Session) -> Result<Vec<(String, String)>, TemplateError> {
    session
        .transcript
        .iter()
        .map(|entry| Ok((render(&entry.speaker, session)?, render(&entry.message, session)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transcript_with;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_renders_character_cue() {
        let s = settings(&[("char", "Yoav")]);
        assert_eq!(render("{{char}}:", &s).unwrap(), "Yoav:");
    }

    #[test]
    fn test_template_without_placeholders_is_unchanged() {
        let s = settings(&[("char", "Yoav")]);
        let text = "plain text with { braces } and }} stray {{ marks";
        assert_eq!(render(text, &s).unwrap(), text);
    }

    #[test]
    fn test_unknown_key_renders_empty() {
        let s = settings(&[]);
        assert_eq!(render("[{{missing}}]", &s).unwrap(), "[]");
    }

    #[test]
    fn test_nested_values_are_expanded() {
        let s = settings(&[
            ("greeting", "Hello {{name}}"),
            ("name", "{{first}} {{last}}"),
            ("first", "Ada"),
            ("last", "Lovelace"),
        ]);
        let out = render("{{greeting}}!", &s).unwrap();
        assert_eq!(out, "Hello Ada Lovelace!");
        assert!(!out.contains("{{") && !out.contains("}}"));
    }

    #[test]
    fn test_self_reference_fails_closed() {
        let s = settings(&[("a", "{{b}}"), ("b", "{{a}}")]);
        let err = render("{{a}}", &s).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::RecursionLimit { depth: MAX_TEMPLATE_DEPTH, .. }
        ));
    }

    #[test]
    fn test_direct_self_reference_fails_closed() {
        let s = settings(&[("loop", "x{{loop}}")]);
        assert!(render("{{loop}}", &s).is_err());
    }

    #[test]
    fn test_overrides_win_over_settings() {
        let s = settings(&[("message", "from settings"), ("char", "Yoav")]);
        let out = render_with("{{char}}: {{message}}", &s, &[("message", "from override")]).unwrap();
        assert_eq!(out, "Yoav: from override");
    }

    #[test]
    fn test_override_values_do_not_reexpand_overrides() {
        let s = settings(&[("user", "Sam")]);
        // A user typing a placeholder gets base settings only.
        let out = render_with("{{message}}", &s, &[("message", "I am {{user}} {{message}}")]).unwrap();
        assert_eq!(out, "I am Sam ");
    }

    #[test]
    fn test_render_is_deterministic() {
        let s = settings(&[("a", "1{{b}}"), ("b", "2")]);
        assert_eq!(render("{{a}}{{b}}", &s).unwrap(), render("{{a}}{{b}}", &s).unwrap());
    }

    #[test]
    fn test_history_uses_current_names() {
        let mut session = Session::default();
        let transcript = transcript_with(&[], TranscriptEntry::user("Hi"));
        let transcript = transcript_with(&transcript, TranscriptEntry::character("Hello"));

        assert_eq!(
            render_history(&session, &transcript).unwrap(),
            "User: Hi\nYoav: Hello"
        );

        session.char = "Ada".to_string();
        assert_eq!(
            render_history(&session, &transcript).unwrap(),
            "User: Hi\nAda: Hello"
        );
    }

    #[test]
    fn test_history_of_empty_transcript_is_empty() {
        assert_eq!(render_history(&Session::default(), &[]).unwrap(), "");
    }

    #[test]
    fn test_display_transcript_resolves_speakers() {
        let mut session = Session::default();
        session.transcript = transcript_with(&[], TranscriptEntry::user("I'm {{user}}"));

        let lines = display_transcript(&session).unwrap();
        assert_eq!(lines, vec![("User".to_string(), "I'm User".to_string())]);
    }
}
