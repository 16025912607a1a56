//! Chat conversations backed by a streaming message backend.

pub mod coalescer;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::inflight::InFlightRegistry;
use crate::schema::{Attachment, ChatMessage, ChatRole, SendRequest, StreamEvent};
use crate::source::{ChatBackend, MessageSource};
use crate::store::Store;

pub use coalescer::{Completion, StreamCoalescer};

/// Render-visible chat state.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    /// Committed messages per conversation.
    pub messages: HashMap<String, Vec<ChatMessage>>,
    /// Flushed, not yet committed assistant text per conversation.
    pub streaming: HashMap<String, String>,
    /// Conversations waiting for their first visible token.
    pub sending: HashSet<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Completed(Completion),
    /// Another send for the conversation is still in flight.
    Suppressed,
    Cancelled,
    Failed(String),
}

#[derive(Clone)]
pub struct ChatStore {
    state: Store<ChatState>,
    coalescer: StreamCoalescer,
    backend: Arc<dyn ChatBackend>,
    history: Arc<dyn MessageSource>,
    sends: InFlightRegistry<String>,
    cancels: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ChatStore {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        history: Arc<dyn MessageSource>,
        config: &ChatConfig,
    ) -> Self {
        Self::with_interval(backend, history, config.flush_interval())
    }

    pub fn with_interval(
        backend: Arc<dyn ChatBackend>,
        history: Arc<dyn MessageSource>,
        flush_interval: Duration,
    ) -> Self {
        let state = Store::new(ChatState::default());
        let coalescer = StreamCoalescer::new(state.clone(), Arc::clone(&history), flush_interval);
        Self {
            state,
            coalescer,
            backend,
            history,
            sends: InFlightRegistry::new(),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.subscribe()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.state
            .read(|s| s.messages.get(conversation_id).cloned().unwrap_or_default())
    }

    pub fn is_sending(&self, conversation_id: &str) -> bool {
        self.state.read(|s| s.sending.contains(conversation_id))
    }

    fn cancel_signals(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace a conversation's messages with the stored history.
    pub async fn load_messages(&self, conversation_id: &str) -> bool {
        match self.history.fetch_messages(conversation_id).await {
            Ok(messages) => {
                self.state.update(|s| {
                    s.messages.insert(conversation_id.to_string(), messages);
                });
                true
            }
            Err(e) => {
                warn!(conversation_id, "failed to load messages: {e}");
                self.state.update(|s| s.error = Some(e.to_string()));
                false
            }
        }
    }

    /// Send a message and drive the reply stream to its terminal event.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        model_id: Option<String>,
    ) -> SendOutcome {
        let Some(_guard) = self.sends.try_acquire(conversation_id.to_string()) else {
            debug!(conversation_id, "send already in flight");
            return SendOutcome::Suppressed;
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel_signals()
            .insert(conversation_id.to_string(), cancel_tx);

        let user_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: ChatRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.state.update(|s| {
            s.messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(user_message);
            s.error = None;
        });
        self.coalescer.begin(conversation_id);

        let request = SendRequest {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            attachments,
            model_id,
        };
        info!(conversation_id, model = ?request.model_id, "sending message");

        let outcome = match self.backend.send(request).await {
            Ok(events) => self.drive(conversation_id, events, cancel_rx).await,
            Err(e) => {
                let error = e.to_string();
                self.fail(conversation_id, &error);
                SendOutcome::Failed(error)
            }
        };

        self.cancel_signals().remove(conversation_id);
        outcome
    }

    async fn drive(
        &self,
        conversation_id: &str,
        mut events: BoxStream<'static, StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> SendOutcome {
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    debug!(conversation_id, "send cancelled");
                    return SendOutcome::Cancelled;
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                let error = "stream ended without a terminal event".to_string();
                warn!(conversation_id, "{error}");
                self.fail(conversation_id, &error);
                return SendOutcome::Failed(error);
            };

            if event.conversation_id() != conversation_id {
                debug!(
                    conversation_id,
                    other = event.conversation_id(),
                    "ignoring event for another conversation"
                );
                continue;
            }

            match event {
                StreamEvent::Chunk { text, .. } => {
                    self.coalescer.append_chunk(conversation_id, &text);
                }
                StreamEvent::Done { message_id, .. } => {
                    let completion = self.coalescer.complete(conversation_id, message_id).await;
                    return SendOutcome::Completed(completion);
                }
                StreamEvent::Error { error, .. } => {
                    warn!(conversation_id, "backend reported error: {error}");
                    self.fail(conversation_id, &error);
                    return SendOutcome::Failed(error);
                }
            }
        }
    }

    /// Append a synthetic assistant message carrying the error and clear the
    /// conversation's streaming state.
    fn fail(&self, conversation_id: &str, error: &str) {
        self.coalescer.reset(conversation_id);
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: ChatRole::Assistant,
            content: format!("Error: {error}"),
            created_at: Utc::now(),
        };
        self.state.update(|s| {
            s.sending.remove(conversation_id);
            s.messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message);
            s.error = Some(error.to_string());
        });
    }

    /// Stop an in-flight send. Fragments the backend still delivers
    /// afterwards are dropped. Returns whether a send was in flight.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let signal = self.cancel_signals().remove(conversation_id);
        let in_flight = signal.is_some();

        if let Err(e) = self.backend.cancel(conversation_id).await {
            warn!(conversation_id, "backend cancel failed: {e}");
        }
        if let Some(tx) = signal {
            let _ = tx.send(());
        }

        self.coalescer.reset(conversation_id);
        self.state
            .update_if(|s| ((), s.sending.remove(conversation_id)));
        in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, Result};
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;

    enum Script {
        Events(Vec<StreamEvent>),
        /// Yields the events, then never terminates.
        Hang(Vec<StreamEvent>),
        Reject(String),
    }

    #[derive(Default)]
    struct ScriptedBackend {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<SendRequest>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn send(&self, request: SendRequest) -> Result<BoxStream<'static, StreamEvent>> {
            self.requests.lock().unwrap().push(request);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Events(events)) => Ok(stream::iter(events).boxed()),
                Some(Script::Hang(events)) => {
                    Ok(stream::iter(events).chain(stream::pending()).boxed())
                }
                Some(Script::Reject(error)) => Err(CoreError::Send(error)),
                None => Err(CoreError::Send("no script".to_string())),
            }
        }

        async fn cancel(&self, conversation_id: &str) -> Result<()> {
            self.cancelled
                .lock()
                .unwrap()
                .push(conversation_id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct EmptyHistory;

    #[async_trait]
    impl MessageSource for EmptyHistory {
        async fn fetch_messages(&self, _conversation_id: &str) -> Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }
    }

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk {
            conversation_id: "c1".to_string(),
            text: text.to_string(),
        }
    }

    fn store(backend: Arc<ScriptedBackend>) -> ChatStore {
        ChatStore::with_interval(backend, Arc::new(EmptyHistory), Duration::from_millis(16))
    }

    #[tokio::test]
    async fn test_send_commits_streamed_reply() {
        let backend = ScriptedBackend::with(vec![Script::Events(vec![
            chunk("Hel"),
            chunk("lo"),
            StreamEvent::Done {
                conversation_id: "c1".to_string(),
                message_id: Some("m-1".to_string()),
            },
        ])]);
        let store = store(backend.clone());

        let outcome = store
            .send_message("c1", "hi", Vec::new(), Some("local".to_string()))
            .await;
        let SendOutcome::Completed(Completion::Committed(reply)) = outcome else {
            panic!("expected a committed reply");
        };
        assert_eq!(reply.id, "m-1");
        assert_eq!(reply.content, "Hello");

        let messages = store.messages("c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1], reply);
        assert!(!store.is_sending("c1"));
        assert_eq!(
            backend.requests.lock().unwrap()[0].model_id.as_deref(),
            Some("local")
        );
    }

    #[tokio::test]
    async fn test_error_event_appends_synthetic_message() {
        let backend = ScriptedBackend::with(vec![Script::Events(vec![
            chunk("partial"),
            StreamEvent::Error {
                conversation_id: "c1".to_string(),
                error: "model crashed".to_string(),
            },
        ])]);
        let store = store(backend);

        let outcome = store.send_message("c1", "hi", Vec::new(), None).await;
        assert_eq!(outcome, SendOutcome::Failed("model crashed".to_string()));

        let state = store.snapshot();
        let messages = &state.messages["c1"];
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert!(messages[1].content.contains("model crashed"));
        assert!(state.streaming.get("c1").is_none());
        assert!(!state.sending.contains("c1"));
        assert_eq!(state.error.as_deref(), Some("model crashed"));
    }

    #[tokio::test]
    async fn test_rejected_send() {
        let backend = ScriptedBackend::with(vec![Script::Reject("offline".to_string())]);
        let store = store(backend);
        let outcome = store.send_message("c1", "hi", Vec::new(), None).await;
        assert_eq!(outcome, SendOutcome::Failed("send error: offline".to_string()));
        assert!(!store.is_sending("c1"));
        assert_eq!(store.messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_event_fails() {
        let backend = ScriptedBackend::with(vec![Script::Events(vec![chunk("dangling")])]);
        let store = store(backend);
        let outcome = store.send_message("c1", "hi", Vec::new(), None).await;
        assert!(matches!(outcome, SendOutcome::Failed(_)));
        assert!(store.snapshot().streaming.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_send_is_suppressed() {
        let backend = ScriptedBackend::with(vec![Script::Hang(Vec::new())]);
        let store = store(backend.clone());

        let background = store.clone();
        let first =
            tokio::spawn(async move { background.send_message("c1", "one", Vec::new(), None).await });
        while !store.is_sending("c1") {
            tokio::task::yield_now().await;
        }

        let second = store.send_message("c1", "two", Vec::new(), None).await;
        assert_eq!(second, SendOutcome::Suppressed);
        assert_eq!(backend.requests.lock().unwrap().len(), 1);

        assert!(store.cancel("c1").await);
        assert_eq!(first.await.unwrap(), SendOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_streamed_text() {
        let backend = ScriptedBackend::with(vec![Script::Hang(vec![chunk("some "), chunk("text")])]);
        let store = store(backend.clone());

        let background = store.clone();
        let send =
            tokio::spawn(async move { background.send_message("c1", "hi", Vec::new(), None).await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            store.snapshot().streaming.get("c1").map(String::as_str),
            Some("some text")
        );

        assert!(store.cancel("c1").await);
        assert_eq!(send.await.unwrap(), SendOutcome::Cancelled);
        assert_eq!(*backend.cancelled.lock().unwrap(), vec!["c1".to_string()]);

        let state = store.snapshot();
        assert!(state.streaming.get("c1").is_none());
        assert!(!state.sending.contains("c1"));
        // only the user message remains
        assert_eq!(state.messages["c1"].len(), 1);

        // nothing in flight any more
        assert!(!store.cancel("c1").await);
    }

    #[tokio::test]
    async fn test_empty_reply_recovers_from_history() {
        let backend = ScriptedBackend::with(vec![Script::Events(vec![StreamEvent::Done {
            conversation_id: "c1".to_string(),
            message_id: None,
        }])]);
        let store = store(backend);
        let outcome = store.send_message("c1", "hi", Vec::new(), None).await;
        assert_eq!(outcome, SendOutcome::Completed(Completion::Recovered(0)));
        // history is authoritative and replaces the optimistic user message
        assert!(store.messages("c1").is_empty());
    }

    #[tokio::test]
    async fn test_events_for_other_conversations_are_ignored() {
        let backend = ScriptedBackend::with(vec![Script::Events(vec![
            StreamEvent::Chunk {
                conversation_id: "c2".to_string(),
                text: "leak".to_string(),
            },
            chunk("ok"),
            StreamEvent::Done {
                conversation_id: "c1".to_string(),
                message_id: None,
            },
        ])]);
        let store = store(backend);
        let outcome = store.send_message("c1", "hi", Vec::new(), None).await;
        let SendOutcome::Completed(Completion::Committed(reply)) = outcome else {
            panic!("expected a committed reply");
        };
        assert_eq!(reply.content, "ok");
        assert!(store.messages("c2").is_empty());
    }
}
