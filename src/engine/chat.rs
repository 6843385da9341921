//! Transcript reducer
//!
//! Applies the decoded reply stream of one send at a time to the
//! transcript. States move `Idle → Sending → Streaming → Settled → Idle`;
//! only one send may be outstanding, and a second `send` while busy is
//! silently ignored.
//!
//! Every transition publishes a fresh transcript snapshot on a watch
//! channel. Failures additionally push a transient [`Notification`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::backend::BackendError;
use crate::conversation::{Message, MessageStore};

use super::stream::{decode, StreamEvent};

/// Reply shown in place of an agent message whose stream failed
pub const APOLOGY: &str = "Sorry, I couldn't process your request right now. Please try again.";

/// Raw reply body, chunk by chunk
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

/// Body sent to the chat message endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    pub source_id: Option<String>,
}

/// Conversation the reducer is bound to for its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub source_id: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, source_id: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            source_id,
        }
    }
}

/// Opens the reply stream for a chat request.
///
/// Resolves once the server has accepted the request and started a body;
/// a non-success status is an error.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<ChunkStream, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReducerState {
    Idle,
    Sending,
    Streaming,
    Settled(Outcome),
}

/// Result of a [`TranscriptReducer::send`] call
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Another send was in flight
    Ignored,
    Completed(Message),
    Failed(String),
}

/// Transient user-facing notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Message cannot be empty")]
    EmptyMessage,
}

pub struct TranscriptReducer {
    context: SessionContext,
    store: MessageStore,
    state: ReducerState,
    last_outcome: Option<Outcome>,
    snapshots: watch::Sender<Vec<Message>>,
    /// Created when a listener takes the receiver; notices are dropped until then
    notifier: Option<mpsc::UnboundedSender<Notification>>,
}

impl TranscriptReducer {
    #[cfg(test)]
    pub fn new(context: SessionContext) -> Self {
        Self::with_history(context, Vec::new())
    }

    /// Start from persisted history loaded at mount time
    pub fn with_history(context: SessionContext, history: Vec<Message>) -> Self {
        let store = MessageStore::with_history(history);
        let (snapshots, _) = watch::channel(store.snapshot());

        Self {
            context,
            store,
            state: ReducerState::Idle,
            last_outcome: None,
            snapshots,
            notifier: None,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn state(&self) -> &ReducerState {
        &self.state
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.last_outcome.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, ReducerState::Sending | ReducerState::Streaming)
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.snapshots.subscribe()
    }

    /// Hand out the notification receiver; only the first caller gets it.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        if self.notifier.is_some() {
            return None;
        }
        let (notifier, notifications) = mpsc::unbounded_channel();
        self.notifier = Some(notifier);
        Some(notifications)
    }

    /// `Idle → Sending`: record the user turn and build the request.
    ///
    /// Returns `Ok(None)` without touching the transcript when a send is
    /// already outstanding.
    pub fn begin(&mut self, input: &str) -> Result<Option<ChatRequest>, ChatError> {
        if self.is_busy() {
            tracing::debug!(state = ?self.state, "send ignored, another reply is in flight");
            return Ok(None);
        }

        let text = input.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        self.store.append(Message::user(text));
        self.transition(ReducerState::Sending);

        Ok(Some(ChatRequest {
            session_id: self.context.session_id.clone(),
            message: text.to_string(),
            source_id: self.context.source_id.clone(),
        }))
    }

    /// `Sending → Streaming`: the server accepted the request
    pub fn accept(&mut self) {
        if self.state != ReducerState::Sending {
            return;
        }
        self.store.append(Message::placeholder());
        self.transition(ReducerState::Streaming);
    }

    /// Apply one decoded event. Returns true once the send has settled.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if self.state != ReducerState::Streaming {
            return !self.is_busy();
        }

        match event {
            StreamEvent::Delta(delta) => {
                self.store.extend_last(&delta);
                self.publish();
                false
            }
            StreamEvent::Done => {
                self.settle_success();
                true
            }
            StreamEvent::Failed(reason) => {
                self.fail(reason);
                true
            }
        }
    }

    /// Settle the current send as failed.
    ///
    /// While streaming the placeholder is overwritten with [`APOLOGY`];
    /// before the stream opened there is no placeholder, so the apology is
    /// appended as the agent turn.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        match self.state {
            ReducerState::Streaming => {
                let failed = match self.store.last() {
                    Some(last) => Message {
                        content: APOLOGY.to_string(),
                        pending: false,
                        ..last.clone()
                    },
                    None => Message::agent(APOLOGY),
                };
                self.store.replace_last(failed);
            }
            ReducerState::Sending => self.store.append(Message::agent(APOLOGY)),
            _ => return,
        }

        tracing::warn!(session_id = %self.context.session_id, %reason, "chat reply failed");
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(Notification {
                text: format!("Failed to get a response: {}", reason),
            });
        }
        self.settle(Outcome::Failure(reason));
    }

    fn settle_success(&mut self) {
        if let Some(last) = self.store.last() {
            let finished = Message {
                pending: false,
                ..last.clone()
            };
            self.store.replace_last(finished);
        }
        self.settle(Outcome::Success);
    }

    fn settle(&mut self, outcome: Outcome) {
        self.last_outcome = Some(outcome.clone());
        self.transition(ReducerState::Settled(outcome));
        self.transition(ReducerState::Idle);
    }

    fn transition(&mut self, next: ReducerState) {
        tracing::debug!(from = ?self.state, to = ?next, "transcript transition");
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.store.snapshot());
    }

    /// Send a user message and stream the reply into the transcript.
    ///
    /// Transport failures settle the send as failed rather than returning
    /// an error; only input validation is an `Err`.
    pub async fn send<T>(&mut self, transport: &T, input: &str) -> Result<SendOutcome, ChatError>
    where
        T: ChatTransport + ?Sized,
    {
        let Some(request) = self.begin(input)? else {
            return Ok(SendOutcome::Ignored);
        };

        match transport.open(&request).await {
            Ok(chunks) => {
                self.accept();
                let events = decode(chunks);
                futures::pin_mut!(events);
                while let Some(event) = events.next().await {
                    if self.apply(event) {
                        break;
                    }
                }
                if self.is_busy() {
                    self.settle_success();
                }
            }
            Err(err) => self.fail(err.to_string()),
        }

        Ok(match self.last_outcome.clone() {
            Some(Outcome::Failure(reason)) => SendOutcome::Failed(reason),
            _ => match self.store.last() {
                Some(reply) => SendOutcome::Completed(reply.clone()),
                None => SendOutcome::Failed("transcript is empty".to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use std::sync::Mutex;

    /// Replays a scripted reply, or refuses the request
    struct ScriptedTransport {
        reply: Result<Vec<Result<Vec<u8>, String>>, (u16, String)>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn chunks(chunks: &[&str]) -> Self {
            Self {
                reply: Ok(chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn with_results(results: Vec<Result<Vec<u8>, String>>) -> Self {
            Self {
                reply: Ok(results),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn refusing(status: u16, detail: &str) -> Self {
            Self {
                reply: Err((status, detail.to_string())),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open(&self, request: &ChatRequest) -> Result<ChunkStream, BackendError> {
            self.requests.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(chunks) => {
                    let chunks: Vec<Result<Vec<u8>, BackendError>> = chunks
                        .iter()
                        .cloned()
                        .map(|c| c.map_err(BackendError::Stream))
                        .collect();
                    Ok(futures::stream::iter(chunks).boxed())
                }
                Err((status, detail)) => Err(BackendError::Status {
                    status: *status,
                    detail: detail.clone(),
                }),
            }
        }
    }

    fn reducer() -> TranscriptReducer {
        TranscriptReducer::new(SessionContext::new("session-1", Some("pdf-9".to_string())))
    }

    #[tokio::test]
    async fn test_send_streams_reply_into_transcript() {
        let transport = ScriptedTransport::chunks(&[
            "data: {\"content\":\"The \"}\n",
            "data: {\"content\":\"doc \"}\ndata: {\"cont",
            "ent\":\"covers X.\"}\n",
            "data: [DONE]\n",
        ]);
        let mut reducer = reducer();

        let outcome = reducer.send(&transport, "What is the summary?").await.unwrap();

        let transcript = reducer.snapshot();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[0].content, "What is the summary?");
        assert_eq!(transcript[1].role, Role::Agent);
        assert_eq!(transcript[1].content, "The doc covers X.");
        assert!(!transcript[1].pending);

        assert_eq!(outcome, SendOutcome::Completed(transcript[1].clone()));
        assert_eq!(reducer.state(), &ReducerState::Idle);
        assert_eq!(reducer.last_outcome(), Some(&Outcome::Success));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(
            requests[0],
            ChatRequest {
                session_id: "session-1".into(),
                message: "What is the summary?".into(),
                source_id: Some("pdf-9".into()),
            }
        );
    }

    #[test]
    fn test_send_while_busy_is_noop() {
        let mut reducer = reducer();
        assert!(reducer.begin("first").unwrap().is_some());
        let len = reducer.snapshot().len();

        assert!(reducer.begin("second").unwrap().is_none());
        assert_eq!(reducer.snapshot().len(), len);

        reducer.accept();
        assert!(reducer.begin("third").unwrap().is_none());
        assert_eq!(reducer.snapshot().len(), len + 1);
    }

    #[test]
    fn test_empty_message_rejected_without_mutation() {
        let mut reducer = reducer();
        assert!(matches!(reducer.begin("   \n"), Err(ChatError::EmptyMessage)));
        assert!(reducer.snapshot().is_empty());
        assert_eq!(reducer.state(), &ReducerState::Idle);
    }

    #[test]
    fn test_at_most_one_pending_through_lifecycle() {
        let mut reducer = reducer();
        for round in 0..3 {
            reducer.begin(&format!("question {}", round)).unwrap();
            assert!(reducer.store.pending_count() <= 1);
            reducer.accept();
            assert_eq!(reducer.store.pending_count(), 1);
            for delta in ["a", "b", "c"] {
                reducer.apply(StreamEvent::Delta(delta.into()));
                assert_eq!(reducer.store.pending_count(), 1);
            }
            if round == 1 {
                assert!(reducer.apply(StreamEvent::Failed("boom".into())));
            } else {
                assert!(reducer.apply(StreamEvent::Done));
            }
            assert_eq!(reducer.store.pending_count(), 0);
        }
        assert_eq!(reducer.snapshot().len(), 6);
    }

    #[tokio::test]
    async fn test_refused_request_appends_apology() {
        let transport = ScriptedTransport::refusing(500, "Internal error");
        let mut reducer = reducer();
        let mut notices = reducer.take_notifications().unwrap();

        let outcome = reducer.send(&transport, "hello").await.unwrap();

        assert!(matches!(outcome, SendOutcome::Failed(ref r) if r.contains("Internal error")));
        let transcript = reducer.snapshot();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].role, Role::Agent);
        assert_eq!(transcript[1].content, APOLOGY);
        assert!(!transcript[1].pending);
        assert_eq!(reducer.state(), &ReducerState::Idle);

        let notice = notices.try_recv().unwrap();
        assert!(notice.text.contains("Internal error"));
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream_replaces_placeholder() {
        let transport = ScriptedTransport::with_results(vec![
            Ok(b"data: {\"content\":\"half an ans\"}\n".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let mut reducer = reducer();

        let outcome = reducer.send(&transport, "hello").await.unwrap();

        assert!(matches!(outcome, SendOutcome::Failed(_)));
        let transcript = reducer.snapshot();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, APOLOGY);
        assert!(matches!(reducer.last_outcome(), Some(Outcome::Failure(_))));

        // Retry is user-initiated and allowed right away
        let retry = ScriptedTransport::chunks(&["data: \"fine\"\n", "data: [DONE]\n"]);
        reducer.send(&retry, "hello").await.unwrap();
        assert_eq!(reducer.snapshot().len(), 4);
        assert_eq!(reducer.snapshot()[3].content, "fine");
    }

    #[tokio::test]
    async fn test_stream_end_without_sentinel_succeeds() {
        let transport = ScriptedTransport::chunks(&["data: {\"content\":\"no sentinel\"}\n"]);
        let mut reducer = reducer();

        let outcome = reducer.send(&transport, "hi").await.unwrap();

        assert!(matches!(outcome, SendOutcome::Completed(ref m) if m.content == "no sentinel"));
        assert_eq!(reducer.last_outcome(), Some(&Outcome::Success));
    }

    #[tokio::test]
    async fn test_snapshots_published_to_subscribers() {
        let transport = ScriptedTransport::chunks(&["data: \"x\"\ndata: [DONE]\n"]);
        let mut reducer = reducer();
        let mut rx = reducer.subscribe();

        reducer.send(&transport, "hi").await.unwrap();

        assert!(rx.has_changed().unwrap());
        let latest = rx.borrow_and_update().clone();
        assert_eq!(latest, reducer.snapshot());
    }

    #[test]
    fn test_history_preloaded() {
        let history = vec![Message::user("earlier"), Message::agent("reply")];
        let reducer = TranscriptReducer::with_history(SessionContext::new("s", None), history);
        assert_eq!(reducer.snapshot().len(), 2);
        assert_eq!(reducer.subscribe().borrow().len(), 2);
    }

    #[test]
    fn test_notifications_only_queued_for_a_listener() {
        let mut reducer = reducer();
        reducer.begin("hello").unwrap();
        reducer.fail("offline");
        assert!(reducer.notifier.is_none());

        let mut notices = reducer.take_notifications().unwrap();
        assert!(reducer.take_notifications().is_none());
        assert!(notices.try_recv().is_err());

        reducer.begin("again").unwrap();
        reducer.fail("still offline");
        assert_eq!(notices.try_recv().unwrap().text, "Failed to get a response: still offline");
    }

    #[test]
    fn test_events_outside_streaming_ignored() {
        let mut reducer = reducer();
        assert!(reducer.apply(StreamEvent::Delta("stray".into())));
        reducer.fail("nothing in flight");
        assert!(reducer.snapshot().is_empty());
        assert!(reducer.last_outcome().is_none());
    }
}
