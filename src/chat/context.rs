//! Session-scoped shared state observed by the front end.
//!
//! Every value lives in a `watch` channel and is replaced as a whole, so a
//! reader always sees either the previous or the next snapshot.

use std::sync::Arc;
use tokio::sync::watch;

use super::generation::GenerationFault;
use super::sampler::{ParamError, SamplingParams};
use super::telemetry::TelemetrySink;
use crate::config::ChatConfig;
use crate::models::{empty_transcript, Session, SettingsError, Transcript};

#[derive(Debug)]
pub struct ChatContext {
    session: watch::Sender<Session>,
    params: watch::Sender<SamplingParams>,
    telemetry: TelemetrySink,
    fault: watch::Sender<Option<Arc<GenerationFault>>>,
}

pub type SharedChatContext = Arc<ChatContext>;

impl Default for ChatContext {
    fn default() -> Self {
        Self::new(Session::default(), SamplingParams::default())
    }
}

impl ChatContext {
    pub fn new(session: Session, params: SamplingParams) -> Self {
        let (session, _) = watch::channel(session);
        let (params, _) = watch::channel(params);
        let (fault, _) = watch::channel(None);
        Self {
            session,
            params,
            telemetry: TelemetrySink::new(),
            fault,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.session.clone(), config.sampling.clone())
    }

    /// Snapshot of the session, transcript included.
    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn transcript(&self) -> Transcript {
        self.session.borrow().transcript.clone()
    }

    pub fn chat_started(&self) -> bool {
        self.session.borrow().chat_started()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    pub(crate) fn replace_transcript(&self, transcript: Transcript) {
        self.session.send_modify(|session| session.transcript = transcript);
    }

    pub(crate) fn clear_transcript(&self) {
        self.replace_transcript(empty_transcript());
    }

    /// Change one session setting (`prompt`, `char`, `historyTemplate`, ...).
    pub fn update_session_field(&self, name: &str, value: &str) -> Result<(), SettingsError> {
        let mut outcome = Ok(());
        self.session.send_if_modified(|session| {
            outcome = session.set_field(name, value);
            outcome.is_ok()
        });
        outcome
    }

    pub fn params(&self) -> SamplingParams {
        self.params.borrow().clone()
    }

    pub fn subscribe_params(&self) -> watch::Receiver<SamplingParams> {
        self.params.subscribe()
    }

    /// Change one sampling parameter from user text.
    pub fn update_param(&self, name: &str, raw: &str) -> Result<(), ParamError> {
        let mut outcome = Ok(());
        self.params.send_if_modified(|params| {
            let mut next = params.clone();
            outcome = next.set_field(name, raw);
            if outcome.is_ok() {
                *params = next;
            }
            outcome.is_ok()
        });
        outcome
    }

    pub fn replace_params(&self, params: SamplingParams) {
        self.params.send_replace(params);
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    /// The fault that ended the last turn, if it failed.
    pub fn last_fault(&self) -> Option<Arc<GenerationFault>> {
        self.fault.borrow().clone()
    }

    pub fn subscribe_faults(&self) -> watch::Receiver<Option<Arc<GenerationFault>>> {
        self.fault.subscribe()
    }

    pub(crate) fn report_fault(&self, fault: GenerationFault) {
        self.fault.send_replace(Some(Arc::new(fault)));
    }

    pub(crate) fn clear_fault(&self) {
        self.fault.send_if_modified(|current| current.take().is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{transcript_with, TranscriptEntry};

    #[test]
    fn test_transcript_replace_is_visible_to_subscribers() {
        let ctx = ChatContext::default();
        let rx = ctx.subscribe_session();
        let before = ctx.transcript();

        ctx.replace_transcript(transcript_with(&before, TranscriptEntry::user("Hi")));

        assert!(before.is_empty());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().transcript.len(), 1);
        assert!(ctx.chat_started());
    }

    #[test]
    fn test_update_session_field_keeps_transcript() {
        let ctx = ChatContext::default();
        ctx.replace_transcript(transcript_with(&[], TranscriptEntry::user("Hi")));

        ctx.update_session_field("char", "Ada").unwrap();

        let session = ctx.session();
        assert_eq!(session.char, "Ada");
        assert_eq!(session.transcript.len(), 1);
        assert!(ctx.update_session_field("colour", "red").is_err());
    }

    #[test]
    fn test_update_param_failure_leaves_params_alone() {
        let ctx = ChatContext::default();
        ctx.update_param("top_k", "12").unwrap();
        assert!(ctx.update_param("top_k", "many").is_err());
        assert_eq!(ctx.params().top_k, 12);
    }
}
