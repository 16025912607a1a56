//! Collaborator contracts consumed by the timeline and chat stores.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::schema::{ActivityDetail, ActivityPage, ChatMessage, SendRequest, StreamEvent};

/// Paged access to the activity history, newest first.
///
/// Implementations must order by a stable key so that repeated calls at the
/// same offset return the same slice, and must return fewer than `limit`
/// activities only at the true end of data.
#[async_trait]
pub trait ActivitySource: Send + Sync + 'static {
    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<ActivityPage>;

    /// Idempotent; `None` when the activity no longer exists.
    async fn fetch_detail(&self, activity_id: &str) -> Result<Option<ActivityDetail>>;

    /// Activity count per `YYYY-MM-DD`. Display only.
    async fn fetch_counts_by_date(&self) -> Result<BTreeMap<String, usize>>;

    /// Returns whether anything was deleted.
    async fn delete_activity(&self, activity_id: &str) -> Result<bool>;
}

/// Authoritative message history of a conversation.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
}

/// Streaming message backend.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Starts a send. The returned stream yields zero or more chunks followed
    /// by exactly one terminal event.
    async fn send(&self, request: SendRequest) -> Result<BoxStream<'static, StreamEvent>>;

    /// Asks the backend to stop producing fragments for a conversation.
    async fn cancel(&self, conversation_id: &str) -> Result<()>;
}
