//! Streaming chat session engine.
//!
//! `ChatSession` owns the backend-facing history and the single-in-flight
//! discipline. Each `send` spawns one exchange task; its updates come back
//! over a channel tagged with the session generation that started it, and
//! `process_next` applies them on the caller's task. `clear` (or dropping
//! the session) aborts the task and bumps the generation so anything it
//! already queued is discarded.

mod events;
mod exchange;
mod transcript;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::Instrument;

pub use events::{
    EntryId, SessionEvent, SessionEventRx, SessionEventTx, TranscriptEntry, create_event_channel,
};
use exchange::{ExchangeUpdate, Tagged, UpdateRx, UpdateTx, run_exchange};
pub use transcript::Transcript;

use crate::config::Config;
use crate::protocol::StreamSignal;
use crate::transport::{ChatError, ChatErrorKind, ChatRequest, ChatTransport, Turn};

/// How to resolve a stream that closes without `event: done` or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEndPolicy {
    /// Treat closure as an implicit done and keep the received text.
    #[default]
    Complete,
    /// Treat closure as a failed exchange.
    Incomplete,
}

/// Tunables for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub stream_end: StreamEndPolicy,
    /// Maximum silence between chunks; `None` waits for closure.
    pub idle_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_end: config.stream_end,
            idle_timeout: config.stream_idle_timeout(),
        }
    }
}

/// Exchange lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Ready for input.
    #[default]
    Idle,
    /// Request issued, waiting for the response to open.
    Sending {
        /// ID of the streaming assistant entry.
        entry_id: EntryId,
    },
    /// Receiving deltas.
    Streaming {
        entry_id: EntryId,
        /// Text received so far in this exchange.
        accumulated: String,
    },
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    fn entry_id(&self) -> Option<EntryId> {
        match self {
            SessionState::Idle => None,
            SessionState::Sending { entry_id } | SessionState::Streaming { entry_id, .. } => {
                Some(*entry_id)
            }
        }
    }
}

/// Why `send` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    /// The input was empty after trimming.
    Empty,
    /// Another exchange is still in flight.
    InFlight,
}

impl fmt::Display for SendRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendRejected::Empty => write!(f, "Message is empty"),
            SendRejected::InFlight => write!(f, "A response is still streaming"),
        }
    }
}

impl std::error::Error for SendRejected {}

/// Formats the user-facing text of a failed exchange.
pub fn error_entry_text(message: &str) -> String {
    format!("Sorry, I encountered an error: {message}. Please try again.")
}

/// A conversation with the chat backend.
pub struct ChatSession<T: ChatTransport> {
    transport: Arc<T>,
    token: String,
    options: SessionOptions,
    history: Vec<Turn>,
    state: SessionState,
    generation: u64,
    task: Option<AbortHandle>,
    updates_tx: UpdateTx,
    updates_rx: UpdateRx,
    events: SessionEventTx,
}

impl<T: ChatTransport> ChatSession<T> {
    /// Creates an idle session that publishes to `events`.
    pub fn new(
        transport: T,
        token: impl Into<String>,
        options: SessionOptions,
        events: SessionEventTx,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            transport: Arc::new(transport),
            token: token.into(),
            options,
            history: Vec::new(),
            state: SessionState::Idle,
            generation: 0,
            task: None,
            updates_tx,
            updates_rx,
            events,
        }
    }

    /// Starts an exchange for `text`.
    ///
    /// The user turn is recorded immediately and the request is issued on a
    /// spawned task, so this must be called inside a Tokio runtime. Returns
    /// the id of the streaming assistant entry.
    ///
    /// # Errors
    /// Returns `SendRejected` (and changes nothing) if `text` is blank or an
    /// exchange is already in flight.
    pub fn send(&mut self, text: &str) -> Result<EntryId, SendRejected> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendRejected::Empty);
        }
        if !self.state.is_idle() {
            return Err(SendRejected::InFlight);
        }

        self.emit(SessionEvent::EntryAppended(TranscriptEntry::user(text)));
        self.history.push(Turn::user(text));
        let request = ChatRequest {
            messages: self.history.clone(),
            token: self.token.clone(),
        };

        self.generation += 1;
        let placeholder = TranscriptEntry::assistant_streaming();
        let entry_id = placeholder.id;
        self.state = SessionState::Sending { entry_id };
        self.emit(SessionEvent::EntryAppended(placeholder));

        tracing::debug!(
            generation = self.generation,
            turns = request.messages.len(),
            "Starting exchange"
        );
        let span = tracing::debug_span!("exchange", generation = self.generation);
        let handle = tokio::spawn(
            run_exchange(
                Arc::clone(&self.transport),
                request,
                self.generation,
                self.options.idle_timeout,
                self.updates_tx.clone(),
            )
            .instrument(span),
        );
        self.task = Some(handle.abort_handle());

        Ok(entry_id)
    }

    /// Resets transcript and history and cancels any exchange in flight.
    pub fn clear(&mut self) {
        self.abort_task();
        self.generation += 1;
        self.history.clear();
        self.state = SessionState::Idle;
        self.emit(SessionEvent::Cleared);
        tracing::debug!(generation = self.generation, "Session cleared");
    }

    /// Waits for the next update of the current exchange and applies it.
    ///
    /// Returns false immediately when idle.
    pub async fn process_next(&mut self) -> bool {
        if self.state.is_idle() {
            return false;
        }
        match self.updates_rx.recv().await {
            Some(tagged) => {
                self.apply(tagged);
                true
            }
            None => false,
        }
    }

    /// Drives the current exchange until it reaches a terminal outcome.
    pub async fn run_until_idle(&mut self) {
        while self.process_next().await {}
    }

    /// Returns true while input must stay disabled.
    pub fn is_send_disabled(&self) -> bool {
        !self.state.is_idle()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn apply(&mut self, tagged: Tagged) {
        if tagged.generation != self.generation || self.state.is_idle() {
            tracing::trace!(
                stale_generation = tagged.generation,
                generation = self.generation,
                "Ignoring stale exchange update"
            );
            return;
        }

        match tagged.update {
            ExchangeUpdate::Opened => self.start_streaming(),
            ExchangeUpdate::Signal(StreamSignal::Delta(text)) => self.push_delta(&text),
            ExchangeUpdate::Signal(StreamSignal::Done) => self.finalize(),
            ExchangeUpdate::Signal(StreamSignal::Error(message)) => {
                self.fail(&ChatError::backend(message));
            }
            ExchangeUpdate::Ended => match self.options.stream_end {
                StreamEndPolicy::Complete => self.finalize(),
                StreamEndPolicy::Incomplete => self.fail(&ChatError::new(
                    ChatErrorKind::Incomplete,
                    "The response ended before it was complete",
                )),
            },
            ExchangeUpdate::Failed(err) => self.fail(&err),
        }
    }

    fn start_streaming(&mut self) {
        if let SessionState::Sending { entry_id } = self.state {
            self.state = SessionState::Streaming {
                entry_id,
                accumulated: String::new(),
            };
        }
    }

    fn push_delta(&mut self, text: &str) {
        self.start_streaming();
        if let SessionState::Streaming {
            entry_id,
            accumulated,
        } = &mut self.state
        {
            accumulated.push_str(text);
            let event = SessionEvent::EntryDelta {
                id: *entry_id,
                content: accumulated.clone(),
            };
            self.emit(event);
        }
    }

    fn finalize(&mut self) {
        let (entry_id, content) = match std::mem::take(&mut self.state) {
            SessionState::Idle => return,
            SessionState::Sending { entry_id } => (entry_id, String::new()),
            SessionState::Streaming {
                entry_id,
                accumulated,
            } => (entry_id, accumulated),
        };
        self.task = None;

        tracing::debug!(
            generation = self.generation,
            chars = content.len(),
            "Exchange completed"
        );
        self.history.push(Turn::assistant(content.clone()));
        self.emit(SessionEvent::EntryFinalized(TranscriptEntry::assistant(
            entry_id, content,
        )));
    }

    fn fail(&mut self, err: &ChatError) {
        let Some(entry_id) = self.state.entry_id() else {
            return;
        };
        self.state = SessionState::Idle;
        self.abort_task();

        tracing::warn!(
            generation = self.generation,
            kind = %err.kind,
            message = %err.message,
            "Exchange failed"
        );
        self.emit(SessionEvent::EntryFailed(TranscriptEntry::error(
            entry_id,
            error_entry_text(&err.message),
        )));
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl<T: ChatTransport> Drop for ChatSession<T> {
    fn drop(&mut self) {
        self.abort_task();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use futures_util::{StreamExt, stream};

    use super::*;
    use crate::transport::{ChatResult, ChunkStream, Role};

    type ChunkTx = mpsc::UnboundedSender<ChatResult<Bytes>>;

    /// What the fake backend does for each `open`, consumed in order.
    enum Script {
        Chunks(Vec<Vec<u8>>),
        Fail(ChatError),
        /// Chunks are pushed by the test through a channel.
        Live(mpsc::UnboundedReceiver<ChatResult<Bytes>>),
    }

    struct FakeTransport {
        scripts: Mutex<Vec<Script>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl FakeTransport {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                requests: Arc::default(),
            }
        }
    }

    impl ChatTransport for FakeTransport {
        async fn open(&self, request: ChatRequest) -> ChatResult<ChunkStream> {
            self.requests.lock().unwrap().push(request);
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                assert!(!scripts.is_empty(), "unexpected open");
                scripts.remove(0)
            };
            match script {
                Script::Chunks(chunks) => Ok(stream::iter(
                    chunks.into_iter().map(|c| Ok(Bytes::from(c))),
                )
                .boxed()),
                Script::Fail(err) => Err(err),
                Script::Live(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()),
            }
        }
    }

    fn chunks(lines: &[&str]) -> Script {
        Script::Chunks(lines.iter().map(|l| l.as_bytes().to_vec()).collect())
    }

    fn live() -> (Script, ChunkTx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Script::Live(rx), tx)
    }

    struct Harness {
        session: ChatSession<FakeTransport>,
        events: SessionEventRx,
        transcript: Transcript,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl Harness {
        fn new(scripts: Vec<Script>) -> Self {
            Self::with_options(scripts, SessionOptions::default())
        }

        fn with_options(scripts: Vec<Script>, options: SessionOptions) -> Self {
            let transport = FakeTransport::new(scripts);
            let requests = Arc::clone(&transport.requests);
            let (tx, events) = create_event_channel();
            Self {
                session: ChatSession::new(transport, "tok-123", options, tx),
                events,
                transcript: Transcript::new(),
                requests,
            }
        }

        /// Applies pending events to the transcript and returns them.
        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                self.transcript.apply(&event);
                drained.push(event);
            }
            drained
        }

        async fn exchange(&mut self, text: &str) -> Vec<SessionEvent> {
            self.session.send(text).unwrap();
            self.session.run_until_idle().await;
            self.drain()
        }
    }

    #[tokio::test]
    async fn test_patient_search_scenario() {
        let mut h = Harness::new(vec![chunks(&[
            "data: {\"text\":\"Found \"}\n",
            "data: {\"text\":\"1 patient.\"}\n",
            "event: done\n",
        ])]);

        h.exchange("Search for patient David Stan").await;

        assert!(h.session.state().is_idle());
        assert_eq!(
            h.session.history(),
            &[
                Turn::user("Search for patient David Stan"),
                Turn::assistant("Found 1 patient."),
            ]
        );
        assert_eq!(h.transcript.len(), 2);
        let answer = h.transcript.last().unwrap();
        assert_eq!(answer.role, Role::Assistant);
        assert_eq!(answer.content, "Found 1 patient.");
        assert!(!answer.streaming);
        assert!(!answer.is_error);
    }

    #[tokio::test]
    async fn test_every_delta_publishes_accumulated_text() {
        let mut h = Harness::new(vec![chunks(&[
            "data: {\"text\":\"a\"}\ndata: {\"text\":\"b\"}\n",
            "data: {\"text\":\"c\"}\nevent: done\n",
        ])]);

        let events = h.exchange("hi").await;

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::EntryDelta { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["a", "ab", "abc"]);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::EntryFinalized(entry)) if entry.content == "abc"
        ));
    }

    #[tokio::test]
    async fn test_protocol_failure_scenario() {
        let mut h = Harness::new(vec![Script::Fail(ChatError::http_status(
            401,
            r#"{"message":"token expired"}"#,
        ))]);

        h.exchange("hello").await;

        assert!(h.session.state().is_idle());
        assert!(!h.session.is_send_disabled());
        assert_eq!(h.session.history(), &[Turn::user("hello")]);
        assert_eq!(h.transcript.len(), 2);
        let errors: Vec<_> = h
            .transcript
            .entries()
            .iter()
            .filter(|e| e.is_error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].content.contains("token expired"));
        assert!(!h.transcript.is_streaming());
    }

    #[tokio::test]
    async fn test_stream_closure_is_implicit_done() {
        let mut h = Harness::new(vec![chunks(&[
            "data: {\"text\":\"Two \"}\n",
            "data: {\"text\":\"deltas\"}\n",
        ])]);

        h.exchange("hi").await;

        assert_eq!(h.session.history()[1], Turn::assistant("Two deltas"));
        assert_eq!(h.transcript.last().unwrap().content, "Two deltas");
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_flushed() {
        let mut h = Harness::new(vec![chunks(&["data: {\"text\":\"tail\"}"])]);

        h.exchange("hi").await;

        assert_eq!(h.session.history()[1], Turn::assistant("tail"));
    }

    #[tokio::test]
    async fn test_stream_closure_with_incomplete_policy_fails() {
        let options = SessionOptions {
            stream_end: StreamEndPolicy::Incomplete,
            ..SessionOptions::default()
        };
        let mut h = Harness::with_options(vec![chunks(&["data: {\"text\":\"half\"}\n"])], options);

        h.exchange("hi").await;

        assert_eq!(h.session.history(), &[Turn::user("hi")]);
        let last = h.transcript.last().unwrap();
        assert!(last.is_error);
        assert!(!last.content.contains("half"));
    }

    #[tokio::test]
    async fn test_stray_empty_record_changes_nothing() {
        let mut with_noise = Harness::new(vec![chunks(&[
            "data: {}\n",
            "data: {\"text\":\"x\"}\n",
            "data: {}\n: ping\nevent: error\n\n",
            "event: done\n",
        ])]);
        let mut without_noise = Harness::new(vec![chunks(&[
            "data: {\"text\":\"x\"}\n",
            "event: done\n",
        ])]);

        let noisy = with_noise.exchange("hi").await;
        let clean = without_noise.exchange("hi").await;

        assert_eq!(noisy.len(), clean.len());
        assert_eq!(with_noise.session.history(), without_noise.session.history());
    }

    #[tokio::test]
    async fn test_backend_error_discards_text_and_stops_reading() {
        let mut h = Harness::new(vec![chunks(&[
            "data: {\"text\":\"partial\"}\n",
            "data: {\"message\":\"FHIR server unavailable\"}\n",
            "data: {\"text\":\" ignored\"}\nevent: done\n",
        ])]);

        let events = h.exchange("hi").await;

        assert_eq!(h.session.history(), &[Turn::user("hi")]);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::EntryFailed(entry))
                if entry.content == "Sorry, I encountered an error: FHIR server unavailable. Please try again."
        ));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SessionEvent::EntryDelta { content, .. } if content.contains("ignored")))
        );
    }

    #[tokio::test]
    async fn test_mid_stream_read_error_is_network_failure() {
        let (script, tx) = live();
        let mut h = Harness::new(vec![script]);
        h.session.send("hi").unwrap();

        tx.send(Ok(Bytes::from_static(b"data: {\"text\":\"a\"}\n")))
            .unwrap();
        tx.send(Err(ChatError::network("Stream reading error: reset")))
            .unwrap();
        h.session.run_until_idle().await;
        h.drain();

        assert_eq!(h.session.history().len(), 1);
        assert!(h.transcript.last().unwrap().content.contains("reset"));
    }

    #[tokio::test]
    async fn test_send_while_in_flight_is_noop() {
        let (script, tx) = live();
        let mut h = Harness::new(vec![script]);

        h.session.send("first").unwrap();
        h.drain();
        let transcript_len = h.transcript.len();
        assert!(h.session.is_send_disabled());

        assert_eq!(h.session.send("second"), Err(SendRejected::InFlight));
        h.drain();
        assert_eq!(h.transcript.len(), transcript_len);
        assert_eq!(h.session.history(), &[Turn::user("first")]);

        tx.send(Ok(Bytes::from_static(b"event: done\n"))).unwrap();
        h.session.run_until_idle().await;
        assert!(!h.session.is_send_disabled());
    }

    #[tokio::test]
    async fn test_blank_input_is_rejected() {
        let mut h = Harness::new(Vec::new());

        assert_eq!(h.session.send("   \n"), Err(SendRejected::Empty));
        assert!(h.drain().is_empty());
        assert!(h.session.history().is_empty());
        assert!(!h.session.process_next().await);
    }

    #[tokio::test]
    async fn test_input_is_trimmed() {
        let mut h = Harness::new(vec![chunks(&["event: done\n"])]);

        h.exchange("  hello  ").await;

        assert_eq!(h.session.history()[0], Turn::user("hello"));
        assert_eq!(h.transcript.entries()[0].content, "hello");
    }

    #[tokio::test]
    async fn test_requests_carry_history_and_token() {
        let mut h = Harness::new(vec![
            chunks(&["data: {\"text\":\"one\"}\nevent: done\n"]),
            Script::Fail(ChatError::network("offline")),
            chunks(&["data: {\"text\":\"three\"}\nevent: done\n"]),
        ]);

        h.exchange("q1").await;
        h.exchange("q2").await;
        h.exchange("q3").await;

        let requests = h.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.token == "tok-123"));
        assert_eq!(requests[0].messages, vec![Turn::user("q1")]);
        assert_eq!(
            requests[2].messages,
            vec![
                Turn::user("q1"),
                Turn::assistant("one"),
                Turn::user("q2"),
                Turn::user("q3"),
            ]
        );
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let mut h = Harness::new(vec![chunks(&["data: {\"text\":\"x\"}\nevent: done\n"])]);
        h.exchange("hi").await;

        h.session.clear();
        h.drain();

        assert!(h.session.state().is_idle());
        assert!(h.session.history().is_empty());
        assert!(h.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_clear_mid_stream_ignores_late_chunks() {
        let (script, tx) = live();
        let mut h = Harness::new(vec![script, chunks(&["data: {\"text\":\"fresh\"}\n"])]);

        h.session.send("first").unwrap();
        tx.send(Ok(Bytes::from_static(b"data: {\"text\":\"old\"}\n")))
            .unwrap();
        // Opened, then the delta.
        assert!(h.session.process_next().await);
        assert!(h.session.process_next().await);
        h.drain();
        assert_eq!(h.transcript.last().unwrap().content, "old");

        h.session.clear();
        let _ = tx.send(Ok(Bytes::from_static(b"data: {\"text\":\" late\"}\nevent: done\n")));
        h.drain();

        assert!(h.session.state().is_idle());
        assert!(h.session.history().is_empty());
        assert!(h.transcript.is_empty());
        assert!(!h.session.process_next().await);

        h.exchange("second").await;
        assert_eq!(
            h.session.history(),
            &[Turn::user("second"), Turn::assistant("fresh")]
        );
        assert!(h.transcript.entries().iter().all(|e| !e.content.contains("old")));
    }

    #[tokio::test]
    async fn test_stale_generation_update_is_ignored() {
        let (script, _tx) = live();
        let mut h = Harness::new(vec![script]);
        h.session.send("hi").unwrap();
        let stale = h.session.generation() - 1;

        h.session
            .updates_tx
            .send(Tagged {
                generation: stale,
                update: ExchangeUpdate::Signal(StreamSignal::Delta("ghost".to_string())),
            })
            .unwrap();
        h.session
            .updates_tx
            .send(Tagged {
                generation: h.session.generation(),
                update: ExchangeUpdate::Signal(StreamSignal::Done),
            })
            .unwrap();
        h.session.run_until_idle().await;
        h.drain();

        assert_eq!(h.session.history()[1], Turn::assistant(""));
        assert!(h.transcript.entries().iter().all(|e| e.content != "ghost"));
    }

    #[tokio::test]
    async fn test_byte_level_splits_decode_identically() {
        let body = "data: {\"text\":\"Patient: Zoë \"}\n\
                    data: {\"text\":\"Ödegaard 🩺\"}\r\n\
                    data: {}\n\
                    event: done\n";
        let one_chunk = Script::Chunks(vec![body.as_bytes().to_vec()]);
        let byte_chunks = Script::Chunks(body.as_bytes().iter().map(|b| vec![*b]).collect());
        let mut h = Harness::new(vec![one_chunk, byte_chunks]);

        h.exchange("a").await;
        h.exchange("b").await;

        let history = h.session.history();
        assert_eq!(history[1], Turn::assistant("Patient: Zoë Ödegaard 🩺"));
        assert_eq!(history[3], history[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fails_silent_stream() {
        let (script, _tx) = live();
        let options = SessionOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            ..SessionOptions::default()
        };
        let mut h = Harness::with_options(vec![script], options);

        h.exchange("hi").await;

        let last = h.transcript.last().unwrap();
        assert!(last.is_error);
        assert!(last.content.contains("No data received for 5s"));
        assert!(h.session.state().is_idle());
    }
}
