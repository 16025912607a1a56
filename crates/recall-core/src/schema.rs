use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// -- Timeline model types --

/// A tracked unit of user activity. Belongs to exactly one `TimelineDay`,
/// determined by the date portion of `start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub source_event_ids: BTreeSet<String>,
    /// Populated once the activity's detail has been loaded.
    #[serde(default)]
    pub event_summaries: Vec<EventSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineDay {
    /// `YYYY-MM-DD`
    pub date: String,
    pub activities: Vec<Activity>,
}

/// One page of the flat, newest-first activity history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityPage {
    pub activities: Vec<Activity>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub kind: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Drill-down for a single activity: event groups and their raw records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDetail {
    pub activity_id: String,
    pub events: Vec<Event>,
}

impl ActivityDetail {
    pub fn summaries(&self) -> Vec<EventSummary> {
        self.events
            .iter()
            .map(|e| EventSummary {
                id: e.id.clone(),
                summary: e.summary.clone(),
                start_time: e.start_time,
                end_time: e.end_time,
                record_count: e.records.len(),
            })
            .collect()
    }
}

/// Fields carried by a partial-update event. `None` leaves the field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialUpdateOutcome {
    pub updated: bool,
    /// The activity changed day buckets.
    pub moved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadDirection {
    Top,
    Bottom,
}

// -- Chat model types --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(ChatRole::System),
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub mime_type: Option<String>,
}

/// Message send request handed to the chat backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub model_id: Option<String>,
}

/// Events delivered by the chat backend, correlated by conversation id.
/// Each send yields zero or more `Chunk`s and exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        conversation_id: String,
        text: String,
    },
    Done {
        conversation_id: String,
        message_id: Option<String>,
    },
    Error {
        conversation_id: String,
        error: String,
    },
}

impl StreamEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            StreamEvent::Chunk { conversation_id, .. }
            | StreamEvent::Done { conversation_id, .. }
            | StreamEvent::Error { conversation_id, .. } => conversation_id,
        }
    }
}
