use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::schema::{ChatMessage, ChatRole};
use crate::source::MessageSource;
use crate::store::Store;

use super::ChatState;

/// Batches streamed fragments per conversation and publishes them to
/// `ChatState::streaming` at most once per flush interval.
#[derive(Clone)]
pub struct StreamCoalescer {
    state: Store<ChatState>,
    history: Arc<dyn MessageSource>,
    interval: Duration,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    next_epoch: Arc<AtomicU64>,
}

#[derive(Default)]
struct Pending {
    buffer: String,
    scheduled: Option<Scheduled>,
    flushed_since_begin: bool,
}

struct Scheduled {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl Pending {
    fn cancel_scheduled(&mut self) {
        if let Some(scheduled) = self.scheduled.take() {
            scheduled.handle.abort();
        }
    }
}

/// How a finished stream was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Committed(ChatMessage),
    /// Nothing was streamed; the history was re-fetched instead. Holds the
    /// number of messages recovered.
    Recovered(usize),
    Failed(String),
}

impl StreamCoalescer {
    pub fn new(state: Store<ChatState>, history: Arc<dyn MessageSource>, interval: Duration) -> Self {
        Self {
            state,
            history,
            interval,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a conversation as waiting for its first token.
    pub fn begin(&self, conversation_id: &str) {
        let mut pending = self.lock();
        if let Some(mut old) = pending.insert(conversation_id.to_string(), Pending::default()) {
            old.cancel_scheduled();
        }
        self.state.update(|s| {
            s.sending.insert(conversation_id.to_string());
            s.streaming.remove(conversation_id);
        });
    }

    pub fn append_chunk(&self, conversation_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let entry = pending.entry(conversation_id.to_string()).or_default();
        entry.buffer.push_str(text);
        if entry.scheduled.is_none() {
            entry.scheduled = Some(self.spawn_flush(conversation_id));
        }
    }

    /// Schedule one flush for the conversation unless one is already pending.
    pub fn schedule_flush(&self, conversation_id: &str) {
        let mut pending = self.lock();
        let entry = pending.entry(conversation_id.to_string()).or_default();
        if entry.scheduled.is_none() {
            entry.scheduled = Some(self.spawn_flush(conversation_id));
        }
    }

    fn spawn_flush(&self, conversation_id: &str) -> Scheduled {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let id = conversation_id.to_string();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            this.flush_scheduled(&id, epoch);
        });
        Scheduled { epoch, handle }
    }

    fn flush_scheduled(&self, conversation_id: &str, epoch: u64) {
        let mut pending = self.lock();
        let Some(entry) = pending.get_mut(conversation_id) else {
            return;
        };
        // superseded by complete/reset/begin or a manual flush
        if entry.scheduled.as_ref().map(|s| s.epoch) != Some(epoch) {
            return;
        }
        entry.scheduled = None;
        self.drain(conversation_id, entry);
    }

    /// Move buffered text into the visible streaming state now.
    pub fn flush(&self, conversation_id: &str) -> bool {
        let mut pending = self.lock();
        let Some(entry) = pending.get_mut(conversation_id) else {
            return false;
        };
        entry.cancel_scheduled();
        self.drain(conversation_id, entry)
    }

    fn drain(&self, conversation_id: &str, entry: &mut Pending) -> bool {
        if entry.buffer.is_empty() {
            return false;
        }
        let text = mem::take(&mut entry.buffer);
        let first = !entry.flushed_since_begin;
        entry.flushed_since_begin = true;
        self.state.update(|s| {
            s.streaming
                .entry(conversation_id.to_string())
                .or_default()
                .push_str(&text);
            if first {
                s.sending.remove(conversation_id);
            }
        });
        true
    }

    /// Settle a finished stream: flush what is left and commit the
    /// accumulated text as an assistant message. When nothing was streamed,
    /// re-fetch the conversation so the authoritative reply is not lost.
    pub async fn complete(&self, conversation_id: &str, message_id: Option<String>) -> Completion {
        let committed = {
            let mut pending = self.lock();
            let leftover = match pending.remove(conversation_id) {
                Some(mut entry) => {
                    entry.cancel_scheduled();
                    entry.buffer
                }
                None => String::new(),
            };
            self.state.update(|s| {
                s.sending.remove(conversation_id);
                let mut text = s.streaming.remove(conversation_id).unwrap_or_default();
                text.push_str(&leftover);
                if text.is_empty() {
                    return None;
                }
                let message = ChatMessage {
                    id: message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    conversation_id: conversation_id.to_string(),
                    role: ChatRole::Assistant,
                    content: text,
                    created_at: Utc::now(),
                };
                s.messages
                    .entry(conversation_id.to_string())
                    .or_default()
                    .push(message.clone());
                Some(message)
            })
        };

        if let Some(message) = committed {
            debug!(conversation_id, len = message.content.len(), "stream committed");
            return Completion::Committed(message);
        }

        debug!(conversation_id, "empty stream, re-fetching history");
        match self.history.fetch_messages(conversation_id).await {
            Ok(messages) => {
                let count = messages.len();
                self.state.update(|s| {
                    s.messages.insert(conversation_id.to_string(), messages);
                });
                Completion::Recovered(count)
            }
            Err(e) => {
                warn!(conversation_id, "failed to re-fetch messages: {e}");
                let error = e.to_string();
                self.state.update(|s| s.error = Some(error.clone()));
                Completion::Failed(error)
            }
        }
    }

    /// Drop buffered and visible streamed text without committing anything.
    pub fn reset(&self, conversation_id: &str) {
        let mut pending = self.lock();
        if let Some(mut entry) = pending.remove(conversation_id) {
            entry.cancel_scheduled();
        }
        self.state
            .update_if(|s| ((), s.streaming.remove(conversation_id).is_some()));
    }

    pub fn is_scheduled(&self, conversation_id: &str) -> bool {
        self.lock()
            .get(conversation_id)
            .is_some_and(|e| e.scheduled.is_some())
    }

    /// Text received but not yet flushed.
    pub fn buffered(&self, conversation_id: &str) -> String {
        self.lock()
            .get(conversation_id)
            .map(|e| e.buffer.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const INTERVAL: Duration = Duration::from_millis(16);

    #[derive(Default)]
    struct FakeHistory {
        messages: Vec<ChatMessage>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageSource for FakeHistory {
        async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::Source("history offline".to_string()));
            }
            Ok(self
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect())
        }
    }

    fn setup(history: FakeHistory) -> (Store<ChatState>, StreamCoalescer, Arc<FakeHistory>) {
        let state = Store::new(ChatState::default());
        let history = Arc::new(history);
        let coalescer = StreamCoalescer::new(state.clone(), history.clone(), INTERVAL);
        (state, coalescer, history)
    }

    fn streaming(state: &Store<ChatState>, id: &str) -> Option<String> {
        state.read(|s| s.streaming.get(id).cloned())
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_coalesce_into_one_flush() {
        let (state, coalescer, _) = setup(FakeHistory::default());
        coalescer.append_chunk("c1", "a");
        coalescer.append_chunk("c1", "b");
        assert!(coalescer.is_scheduled("c1"));
        assert_eq!(streaming(&state, "c1"), None);

        let version = state.version();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(streaming(&state, "c1").as_deref(), Some("ab"));
        assert_eq!(state.version(), version + 1);
        assert!(!coalescer.is_scheduled("c1"));
        assert_eq!(coalescer.buffered("c1"), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_flush_is_idempotent() {
        let (state, coalescer, _) = setup(FakeHistory::default());
        coalescer.append_chunk("c1", "x");
        coalescer.schedule_flush("c1");
        coalescer.schedule_flush("c1");
        let version = state.version();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.version(), version + 1);
        assert_eq!(streaming(&state, "c1").as_deref(), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_flush_clears_sending() {
        let (state, coalescer, _) = setup(FakeHistory::default());
        coalescer.begin("c1");
        assert!(state.read(|s| s.sending.contains("c1")));

        coalescer.append_chunk("c1", "he");
        // still waiting: the chunk is buffered, not yet visible
        assert!(state.read(|s| s.sending.contains("c1")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!state.read(|s| s.sending.contains("c1")));

        coalescer.append_chunk("c1", "llo");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(streaming(&state, "c1").as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversations_flush_independently() {
        let (state, coalescer, _) = setup(FakeHistory::default());
        coalescer.append_chunk("c1", "one");
        coalescer.append_chunk("c2", "two");
        assert!(coalescer.flush("c2"));
        assert_eq!(streaming(&state, "c2").as_deref(), Some("two"));
        assert_eq!(streaming(&state, "c1"), None);
        assert!(coalescer.is_scheduled("c1"));
        assert!(!coalescer.is_scheduled("c2"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(streaming(&state, "c1").as_deref(), Some("one"));
        assert_eq!(streaming(&state, "c2").as_deref(), Some("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_flushes_synchronously() {
        let (state, coalescer, history) = setup(FakeHistory::default());
        coalescer.begin("c1");
        coalescer.append_chunk("c1", "par");
        coalescer.flush("c1");
        coalescer.append_chunk("c1", "tial");

        let completion = coalescer.complete("c1", Some("m-42".to_string())).await;
        let Completion::Committed(message) = completion else {
            panic!("expected a committed message");
        };
        assert_eq!(message.id, "m-42");
        assert_eq!(message.content, "partial");
        assert_eq!(message.role, ChatRole::Assistant);

        let snapshot = state.snapshot();
        assert!(snapshot.streaming.get("c1").is_none());
        assert!(!snapshot.sending.contains("c1"));
        assert_eq!(snapshot.messages["c1"], vec![message]);
        assert_eq!(history.calls.load(Ordering::SeqCst), 0);

        // the aborted timer never fires a stale flush
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.read(|s| s.streaming.get("c1").is_none()));
    }

    #[tokio::test]
    async fn test_complete_generates_id() {
        let (_, coalescer, _) = setup(FakeHistory::default());
        coalescer.append_chunk("c1", "hi");
        let Completion::Committed(message) = coalescer.complete("c1", None).await else {
            panic!("expected a committed message");
        };
        assert!(Uuid::parse_str(&message.id).is_ok());
    }

    #[tokio::test]
    async fn test_complete_empty_stream_refetches() {
        let stored = ChatMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            role: ChatRole::Assistant,
            content: "authoritative".to_string(),
            created_at: Utc::now(),
        };
        let (state, coalescer, history) = setup(FakeHistory {
            messages: vec![stored.clone()],
            ..Default::default()
        });
        coalescer.begin("c1");

        assert_eq!(coalescer.complete("c1", None).await, Completion::Recovered(1));
        assert_eq!(history.calls.load(Ordering::SeqCst), 1);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages["c1"], vec![stored]);
        assert!(!snapshot.sending.contains("c1"));
    }

    #[tokio::test]
    async fn test_complete_refetch_failure_is_recorded() {
        let (state, coalescer, _) = setup(FakeHistory {
            fail: true,
            ..Default::default()
        });
        coalescer.begin("c1");
        let completion = coalescer.complete("c1", None).await;
        assert!(matches!(completion, Completion::Failed(_)));
        let snapshot = state.snapshot();
        assert!(snapshot.error.is_some());
        assert!(!snapshot.sending.contains("c1"));
        assert!(snapshot.messages.get("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_and_restarts() {
        let (state, coalescer, _) = setup(FakeHistory::default());
        coalescer.append_chunk("c1", "old");
        coalescer.flush("c1");
        coalescer.append_chunk("c1", "pending");

        coalescer.reset("c1");
        assert_eq!(streaming(&state, "c1"), None);
        assert_eq!(coalescer.buffered("c1"), "");
        assert!(!coalescer.is_scheduled("c1"));

        coalescer.append_chunk("c1", "x");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(streaming(&state, "c1").as_deref(), Some("x"));
        assert!(state.read(|s| s.messages.is_empty()));
    }
}
