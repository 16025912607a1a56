use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use recall_core::db::Database;
use recall_core::error::{CoreError, Result};
use recall_core::schema::{ChatMessage, ChatRole, SendRequest, StreamEvent};
use recall_core::source::ChatBackend;
use tracing::debug;
use uuid::Uuid;

/// Local chat backend that "answers" with the contents of a text file,
/// streamed in small fragments. Both sides of the exchange are written to
/// the message history.
pub struct ReplayBackend {
    db: Arc<Mutex<Database>>,
    reply: String,
    chunk_chars: usize,
    delay: Duration,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl ReplayBackend {
    pub fn new(db: Arc<Mutex<Database>>, reply: String, chunk_chars: usize, delay: Duration) -> Self {
        Self {
            db,
            reply,
            chunk_chars: chunk_chars.max(1),
            delay,
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn chunks(&self) -> Vec<String> {
        let chars: Vec<char> = self.reply.chars().collect();
        chars
            .chunks(self.chunk_chars)
            .map(|c| c.iter().collect())
            .collect()
    }
}

fn store_message(db: &Mutex<Database>, message: &ChatMessage) -> Result<()> {
    let db = db
        .lock()
        .map_err(|e| CoreError::Send(format!("lock: {e}")))?;
    db.insert_message(message)
}

#[async_trait]
impl ChatBackend for ReplayBackend {
    async fn send(&self, request: SendRequest) -> Result<BoxStream<'static, StreamEvent>> {
        store_message(
            &self.db,
            &ChatMessage {
                id: Uuid::new_v4().to_string(),
                conversation_id: request.conversation_id.clone(),
                role: ChatRole::User,
                content: request.content.clone(),
                created_at: Utc::now(),
            },
        )?;
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.remove(&request.conversation_id);
        }

        let chunks = self.chunks();
        let reply = self.reply.clone();
        let delay = self.delay;
        let db = Arc::clone(&self.db);
        let cancelled = Arc::clone(&self.cancelled);
        let conversation_id = request.conversation_id;

        let events = async_stream::stream! {
            for text in chunks {
                tokio::time::sleep(delay).await;
                let stop = cancelled
                    .lock()
                    .map(|c| c.contains(&conversation_id))
                    .unwrap_or(false);
                if stop {
                    debug!(conversation_id = %conversation_id, "replay cancelled");
                    return;
                }
                yield StreamEvent::Chunk {
                    conversation_id: conversation_id.clone(),
                    text,
                };
            }

            let message = ChatMessage {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.clone(),
                role: ChatRole::Assistant,
                content: reply,
                created_at: Utc::now(),
            };
            match store_message(&db, &message) {
                Ok(()) => yield StreamEvent::Done {
                    conversation_id,
                    message_id: Some(message.id),
                },
                Err(e) => yield StreamEvent::Error {
                    conversation_id,
                    error: e.to_string(),
                },
            }
        };
        Ok(events.boxed())
    }

    async fn cancel(&self, conversation_id: &str) -> Result<()> {
        self.cancelled
            .lock()
            .map_err(|e| CoreError::Send(format!("lock: {e}")))?
            .insert(conversation_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(reply: &str, chunk_chars: usize) -> ReplayBackend {
        let db = Database::open_in_memory().unwrap();
        ReplayBackend::new(Arc::new(Mutex::new(db)), reply.to_string(), chunk_chars, Duration::ZERO)
    }

    fn request(conversation_id: &str) -> SendRequest {
        SendRequest {
            conversation_id: conversation_id.to_string(),
            content: "hi".to_string(),
            attachments: Vec::new(),
            model_id: None,
        }
    }

    #[test]
    fn test_chunks_split_on_char_boundaries() {
        let chunks = backend("héllo wörld ✓", 3).chunks();
        assert_eq!(chunks[0], "hél");
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
        assert_eq!(chunks.concat(), "héllo wörld ✓");

        // a zero chunk size still makes progress
        assert_eq!(backend("ab", 0).chunks(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_replay_streams_and_persists() {
        let backend = backend("abcde", 2);
        let events: Vec<StreamEvent> = backend.send(request("c1")).await.unwrap().collect().await;

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["ab", "cd", "e"]);
        let Some(StreamEvent::Done { message_id: Some(id), .. }) = events.last() else {
            panic!("expected a done event with a message id");
        };

        let stored = backend.db.lock().unwrap().get_messages("c1").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].id, *id);
        assert_eq!(stored[1].content, "abcde");
    }

    #[tokio::test]
    async fn test_cancel_stops_yielding_chunks() {
        let backend = backend("abcdef", 2);
        let mut events = backend.send(request("c1")).await.unwrap();

        let first = events.next().await;
        assert!(matches!(first, Some(StreamEvent::Chunk { ref text, .. }) if text == "ab"));

        backend.cancel("c1").await.unwrap();
        assert!(events.next().await.is_none());

        // only the user side was persisted
        let stored = backend.db.lock().unwrap().get_messages("c1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, ChatRole::User);
    }
}
