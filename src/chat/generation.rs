//! Turn lifecycle: one streamed completion at a time per conversation.
//!
//! `submit_turn` records the user's message, then a spawned task streams
//! the reply into the transcript chunk by chunk. The controller state lives
//! behind a `std::sync::Mutex` that is never held across an await; chunk
//! writes happen under it and only while their turn is still the active
//! one, so nothing lands after `cancel_turn` returns.

use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::SharedChatContext;
use super::sampler::SamplingParams;
use super::stop_conditions::stop_sequences;
use super::templates::{render_history, render_with, TemplateError};
use crate::models::{transcript_with, Session, Timings, Transcript, TranscriptEntry};
use crate::transport::{CompletionRequest, CompletionTransport, TransportError};
use log::{debug, info, warn};

/// Why a turn ended early. Cancellation is not a fault.
#[derive(Debug, thiserror::Error)]
pub enum GenerationFault {
    #[error("prompt rendering failed: {0}")]
    Template(#[from] TemplateError),
    #[error("completion stream failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
struct ActiveTurn {
    id: Uuid,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
enum GenerationState {
    #[default]
    Idle,
    Generating(ActiveTurn),
}

impl GenerationState {
    fn is_turn(&self, id: Uuid) -> bool {
        matches!(self, GenerationState::Generating(turn) if turn.id == id)
    }
}

fn lock_state(state: &Mutex<GenerationState>) -> MutexGuard<'_, GenerationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cancel_active(state: &mut GenerationState) {
    if let GenerationState::Generating(turn) = std::mem::take(state) {
        turn.cancel.cancel();
        info!("[{}] Turn cancelled", turn.id);
    }
}

#[derive(Clone)]
pub struct GenerationController {
    context: SharedChatContext,
    transport: Arc<dyn CompletionTransport>,
    state: Arc<Mutex<GenerationState>>,
}

impl GenerationController {
    pub fn new(context: SharedChatContext, transport: Arc<dyn CompletionTransport>) -> Self {
        Self {
            context,
            transport,
            state: Arc::new(Mutex::new(GenerationState::Idle)),
        }
    }

    pub fn context(&self) -> &SharedChatContext {
        &self.context
    }

    pub fn is_generating(&self) -> bool {
        matches!(*lock_state(&self.state), GenerationState::Generating(_))
    }

    /// Start a turn for `message`.
    ///
    /// Returns `None` without touching anything if a turn is already
    /// running. Otherwise the user entry is in the transcript by the time
    /// this returns, and the reply streams in on a spawned task. Must be
    /// called from within a tokio runtime.
    pub fn submit_turn(&self, message: impl Into<String>) -> Option<TurnHandle> {
        let message = message.into();
        let mut state = lock_state(&self.state);
        if let GenerationState::Generating(turn) = &*state {
            info!("[{}] Generation already in progress, ignoring new message", turn.id);
            return None;
        }

        let turn = ActiveTurn {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        };
        *state = GenerationState::Generating(turn.clone());
        self.context.clear_fault();

        let snapshot = self.context.session();
        let with_user = transcript_with(&snapshot.transcript, TranscriptEntry::user(message.as_str()));
        self.context.replace_transcript(with_user.clone());
        let params = self.context.params();
        drop(state);

        info!("[{}] Turn started ({} chars)", turn.id, message.len());
        let guard = TurnGuard {
            state: Arc::clone(&self.state),
            id: turn.id,
        };
        let job = TurnJob {
            context: Arc::clone(&self.context),
            transport: Arc::clone(&self.transport),
            turn: turn.clone(),
            snapshot,
            params,
            message,
            with_user,
        };
        let task = tokio::spawn(job.run(guard));

        Some(TurnHandle { id: turn.id, task })
    }

    /// Stop the active turn, if any. The partial reply stays in the transcript.
    pub fn cancel_turn(&self) {
        cancel_active(&mut lock_state(&self.state));
    }

    /// Cancel any active turn and start over with an empty transcript.
    pub fn reset_conversation(&self) {
        // A concurrent submit lands either before the cancel or after the clear.
        let mut state = lock_state(&self.state);
        cancel_active(&mut state);
        self.context.clear_transcript();
        drop(state);
        info!("Conversation reset");
    }
}

/// Awaitable handle on a spawned turn.
#[derive(Debug)]
pub struct TurnHandle {
    id: Uuid,
    task: JoinHandle<()>,
}

impl TurnHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait until the turn's task has fully exited.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            warn!("[{}] Turn task ended abnormally: {e}", self.id);
        }
    }
}

/// Returns the controller to `Idle` when the turn's task exits, however it
/// exits, unless a newer turn has taken over in the meantime.
struct TurnGuard {
    state: Arc<Mutex<GenerationState>>,
    id: Uuid,
}

impl TurnGuard {
    /// Publish one chunk's writes. Returns `false` once the turn is no
    /// longer active, in which case nothing was written.
    fn commit(&self, context: &SharedChatContext, transcript: Transcript, timings: Option<Timings>) -> bool {
        let state = lock_state(&self.state);
        if !state.is_turn(self.id) {
            return false;
        }
        context.replace_transcript(transcript);
        if let Some(timings) = timings {
            context.telemetry().observe_timing(timings);
        }
        true
    }

    fn fail(self, context: &SharedChatContext, fault: GenerationFault) {
        let mut state = lock_state(&self.state);
        if !state.is_turn(self.id) {
            debug!("[{}] Dropping fault from inactive turn: {fault}", self.id);
            return;
        }
        *state = GenerationState::Idle;
        warn!("[{}] Turn failed: {fault}", self.id);
        context.report_fault(fault);
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        if state.is_turn(self.id) {
            *state = GenerationState::Idle;
        }
    }
}

struct TurnJob {
    context: SharedChatContext,
    transport: Arc<dyn CompletionTransport>,
    turn: ActiveTurn,
    snapshot: Session,
    params: SamplingParams,
    message: String,
    with_user: Transcript,
}

impl TurnJob {
    async fn run(self, guard: TurnGuard) {
        let context = Arc::clone(&self.context);
        match self.stream_reply(&guard).await {
            Ok(()) => drop(guard),
            Err(fault) => guard.fail(&context, fault),
        }
    }

    async fn stream_reply(self, guard: &TurnGuard) -> Result<(), GenerationFault> {
        let id = self.turn.id;
        let history = render_history(&self.snapshot, &self.snapshot.transcript)?;
        let prompt = render_with(
            &self.snapshot.template,
            &self.snapshot,
            &[("message", self.message.as_str()), ("history", history.as_str())],
        )?;
        let stop = stop_sequences(&self.snapshot)?;
        debug!("[{id}] Prompt ({} chars), stop: {:?}", prompt.len(), stop);
        self.params.log_strategy(&id.to_string());

        let request = CompletionRequest {
            prompt,
            params: self.params,
            stop,
        };
        let mut stream = self
            .transport
            .stream_completion(request, self.turn.cancel.clone());

        let mut reply = String::new();
        let mut chunks = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.turn.cancel.cancelled() => {
                    debug!("[{id}] Stopped after {chunks} chunks");
                    return Ok(());
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            chunks += 1;

            reply.push_str(&chunk.content);
            let trimmed = reply.trim_start().len();
            if trimmed != reply.len() {
                reply.drain(..reply.len() - trimmed);
            }

            let transcript = transcript_with(&self.with_user, TranscriptEntry::character(reply.as_str()));
            if !guard.commit(&self.context, transcript, chunk.timings) {
                debug!("[{id}] Turn no longer active, discarding chunk {chunks}");
                return Ok(());
            }
            if chunk.stop {
                info!("[{id}] Completion finished ({chunks} chunks, {} chars)", reply.len());
            }
        }

        debug!("[{id}] Stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::context::ChatContext;
    use crate::chat_mock::ScriptedTransport;
    use crate::models::CompletionChunk;

    fn setup() -> (GenerationController, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let controller = GenerationController::new(Arc::new(ChatContext::default()), transport.clone());
        (controller, transport)
    }

    fn entries(controller: &GenerationController) -> Vec<TranscriptEntry> {
        controller.context().transcript().to_vec()
    }

    /// Wait until the transcript satisfies `cond`.
    async fn transcript_until(controller: &GenerationController, cond: impl Fn(&[TranscriptEntry]) -> bool) {
        let mut rx = controller.context().subscribe_session();
        rx.wait_for(|session| cond(&session.transcript[..])).await.unwrap();
    }

    #[tokio::test]
    async fn test_user_entry_is_appended_before_any_chunk() {
        let (controller, transport) = setup();
        let _tx = transport.script_turn();

        let handle = controller.submit_turn("Hi");

        assert!(handle.is_some());
        assert!(controller.is_generating());
        assert_eq!(entries(&controller), vec![TranscriptEntry::user("Hi")]);
    }

    #[tokio::test]
    async fn test_streams_reply_into_transcript() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hi").unwrap();

        tx.send(Ok(CompletionChunk::text("Hello"))).unwrap();
        transcript_until(&controller, |t| t.len() == 2).await;
        assert_eq!(entries(&controller)[1], TranscriptEntry::character("Hello"));

        let timings = Timings {
            predicted_per_token_ms: 12.3,
            predicted_per_second: 81.3,
        };
        tx.send(Ok(CompletionChunk::last(" there", Some(timings)))).unwrap();
        drop(tx);
        handle.finished().await;

        assert_eq!(
            entries(&controller),
            vec![TranscriptEntry::user("Hi"), TranscriptEntry::character("Hello there")]
        );
        assert_eq!(controller.context().telemetry().current_timing(), Some(timings));
        assert!(!controller.is_generating());
        assert!(controller.context().last_fault().is_none());
    }

    #[tokio::test]
    async fn test_leading_whitespace_is_trimmed() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hey").unwrap();

        tx.send(Ok(CompletionChunk::text("   Hi"))).unwrap();
        tx.send(Ok(CompletionChunk::last(" there", None))).unwrap();
        drop(tx);
        handle.finished().await;

        assert_eq!(entries(&controller)[1], TranscriptEntry::character("Hi there"));
    }

    #[tokio::test]
    async fn test_whitespace_only_chunks_leave_empty_reply() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hey").unwrap();

        tx.send(Ok(CompletionChunk::text("\n "))).unwrap();
        drop(tx);
        handle.finished().await;

        assert_eq!(entries(&controller)[1], TranscriptEntry::character(""));
    }

    #[tokio::test]
    async fn test_second_submit_while_generating_is_ignored() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("A").unwrap();

        assert!(controller.submit_turn("B").is_none());
        assert_eq!(entries(&controller), vec![TranscriptEntry::user("A")]);

        tx.send(Ok(CompletionChunk::last("ok", None))).unwrap();
        drop(tx);
        handle.finished().await;

        assert_eq!(entries(&controller).len(), 2);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_reply_and_allows_next_turn() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hi").unwrap();

        tx.send(Ok(CompletionChunk::text("Hel"))).unwrap();
        transcript_until(&controller, |t| t.len() == 2).await;

        controller.cancel_turn();
        assert!(!controller.is_generating());

        // Anything sent after the cancel must not reach the transcript.
        let _ = tx.send(Ok(CompletionChunk::text("lo")));
        handle.finished().await;
        assert_eq!(entries(&controller)[1], TranscriptEntry::character("Hel"));

        let next_tx = transport.script_turn();
        let next = controller.submit_turn("Again");
        assert!(next.is_some());
        assert_eq!(entries(&controller).len(), 3);
        drop(next_tx);
        next.unwrap().finished().await;
    }

    #[tokio::test]
    async fn test_reset_while_generating() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hi").unwrap();
        tx.send(Ok(CompletionChunk::text("Hello"))).unwrap();
        transcript_until(&controller, |t| t.len() == 2).await;

        controller.reset_conversation();

        assert!(!controller.is_generating());
        assert!(entries(&controller).is_empty());
        let _ = tx.send(Ok(CompletionChunk::text(" again")));
        handle.finished().await;
        assert!(entries(&controller).is_empty());
        assert!(!controller.context().chat_started());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reset_racing_submit_never_resurrects_old_transcript() {
        for _ in 0..50 {
            let (controller, transport) = setup();
            let first = transport.script_turn();
            controller.submit_turn("old").unwrap();
            first.send(Ok(CompletionChunk::text("stale"))).unwrap();
            transcript_until(&controller, |t| t.len() == 2).await;

            let tx = transport.script_turn();
            let resetter = controller.clone();
            let reset = tokio::spawn(async move { resetter.reset_conversation() });
            let submitted = controller.submit_turn("new");
            reset.await.unwrap();

            let _ = tx.send(Ok(CompletionChunk::last("fresh", None)));
            drop(tx);
            drop(first);
            if let Some(handle) = submitted {
                handle.finished().await;
            }

            let transcript = entries(&controller);
            assert!(transcript.iter().all(|e| e.message != "old" && e.message != "stale"));
        }
    }

    #[tokio::test]
    async fn test_reset_when_idle_clears_transcript() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hi").unwrap();
        drop(tx);
        handle.finished().await;

        controller.reset_conversation();
        assert!(entries(&controller).is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_reports_fault_and_returns_idle() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hi").unwrap();

        tx.send(Ok(CompletionChunk::text("Par"))).unwrap();
        tx.send(Err(TransportError::Server("slot unavailable".to_string())))
            .unwrap();
        handle.finished().await;

        assert!(!controller.is_generating());
        assert_eq!(entries(&controller)[1], TranscriptEntry::character("Par"));
        let fault = controller.context().last_fault().unwrap();
        assert!(matches!(*fault, GenerationFault::Transport(TransportError::Server(_))));

        // A new turn clears the previous fault.
        let _next_tx = transport.script_turn();
        controller.submit_turn("Retry").unwrap();
        assert!(controller.context().last_fault().is_none());
    }

    #[tokio::test]
    async fn test_template_fault_ends_turn() {
        let (controller, transport) = setup();
        controller
            .context()
            .update_session_field("prompt", "{{prompt}}")
            .unwrap();

        let handle = controller.submit_turn("Hi").unwrap();
        handle.finished().await;

        assert!(!controller.is_generating());
        assert!(matches!(
            *controller.context().last_fault().unwrap(),
            GenerationFault::Template(TemplateError::RecursionLimit { .. })
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_prompt_stop_and_params() {
        let (controller, transport) = setup();
        controller.context().update_param("temperature", "0.2").unwrap();
        let tx = transport.script_turn();
        drop(tx);

        controller.submit_turn("Hi").unwrap().finished().await;

        let request = &transport.requests()[0];
        assert_eq!(
            request.prompt,
            "This is a conversation between user and Yoav, a chatbot. respond in simple markdown.\n\n\nUser: Hi\nYoav:"
        );
        assert_eq!(request.stop, vec!["</s>", "Yoav:", "User:"]);
        assert_eq!(request.params.temperature, 0.2);
    }

    #[tokio::test]
    async fn test_history_holds_prior_turns_only() {
        let (controller, transport) = setup();
        let tx = transport.script_turn();
        let handle = controller.submit_turn("Hi").unwrap();
        tx.send(Ok(CompletionChunk::last("Hello", None))).unwrap();
        drop(tx);
        handle.finished().await;

        drop(transport.script_turn());
        controller.submit_turn("How are you?").unwrap().finished().await;

        let prompt = &transport.requests()[1].prompt;
        assert!(prompt.ends_with("User: Hi\nYoav: Hello\nUser: How are you?\nYoav:"));
        assert_eq!(prompt.matches("How are you?").count(), 1);
    }

    #[tokio::test]
    async fn test_message_placeholders_are_not_reexpanded() {
        let (controller, transport) = setup();
        drop(transport.script_turn());

        controller.submit_turn("say {{message}}").unwrap().finished().await;

        let prompt = &transport.requests()[0].prompt;
        assert!(prompt.ends_with("User: say \nYoav:"));
        assert_eq!(entries(&controller)[0], TranscriptEntry::user("say {{message}}"));
    }
}
