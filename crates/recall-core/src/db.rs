use crate::error::{CoreError, Result};
use crate::ingest::day_key;
use crate::schema::{
    Activity, ActivityDetail, ActivityPage, ChatMessage, ChatRole, Event, RawRecord,
};
use crate::source::{ActivitySource, MessageSource};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

const ACTIVITY_COLUMNS: &str =
    "id, title, description, name, start_time, end_time, version, source_event_ids";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, apply PRAGMAs and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(&mut self) -> Result<()> {
        embedded::migrations::runner()
            .run(&mut self.conn)
            .map_err(|e| CoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Insert an activity, replacing every field of an existing row with the same id.
    pub fn upsert_activity(&self, activity: &Activity) -> Result<()> {
        let source_ids = serde_json::to_string(&activity.source_event_ids)?;
        self.conn.execute(
            "INSERT INTO activities (id, title, description, name, start_time, end_time,
                                     version, source_event_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                name = excluded.name,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                version = excluded.version,
                source_event_ids = excluded.source_event_ids",
            params![
                activity.id,
                activity.title,
                activity.description,
                activity.name,
                activity.start_time.timestamp_millis(),
                activity.end_time.timestamp_millis(),
                activity.version as i64,
                source_ids,
            ],
        )?;
        Ok(())
    }

    /// Insert an event group and its raw records under an activity.
    pub fn insert_event(&self, activity_id: &str, event: &Event) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO events (id, activity_id, summary, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                activity_id,
                event.summary,
                event.start_time.timestamp_millis(),
                event.end_time.timestamp_millis(),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO raw_records (id, event_id, kind, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in &event.records {
                stmt.execute(params![
                    r.id,
                    event.id,
                    r.kind,
                    r.content,
                    r.timestamp.timestamp_millis(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_activity(&self, id: &str) -> Result<Option<Activity>> {
        let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], activity_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Flat page of activities, newest first. Ties on `start_time` are broken
    /// by id so that the same offset always yields the same slice.
    pub fn fetch_activity_page(&self, limit: usize, offset: usize) -> Result<Vec<Activity>> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities
             ORDER BY start_time DESC, id DESC
             LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], activity_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Events and raw records for an activity, oldest first.
    pub fn get_activity_detail(&self, activity_id: &str) -> Result<Option<ActivityDetail>> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM activities WHERE id = ?1)",
            params![activity_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, summary, start_time, end_time FROM events
             WHERE activity_id = ?1
             ORDER BY start_time, id",
        )?;
        let mut events = stmt
            .query_map(params![activity_id], |row| {
                Ok(Event {
                    id: row.get(0)?,
                    summary: row.get(1)?,
                    start_time: millis_column(row, 2)?,
                    end_time: millis_column(row, 3)?,
                    records: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT r.event_id, r.id, r.kind, r.content, r.timestamp
             FROM raw_records r
             JOIN events e ON e.id = r.event_id
             WHERE e.activity_id = ?1
             ORDER BY r.timestamp, r.id",
        )?;
        let rows = stmt.query_map(params![activity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RawRecord {
                    id: row.get(1)?,
                    kind: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: millis_column(row, 4)?,
                },
            ))
        })?;

        let mut by_event: HashMap<String, Vec<RawRecord>> = HashMap::new();
        for row in rows {
            let (event_id, record) = row?;
            by_event.entry(event_id).or_default().push(record);
        }
        for event in &mut events {
            if let Some(records) = by_event.remove(&event.id) {
                event.records = records;
            }
        }

        Ok(Some(ActivityDetail {
            activity_id: activity_id.to_string(),
            events,
        }))
    }

    /// Activity count per `YYYY-MM-DD` (bucketed in `offset`).
    pub fn activity_counts_by_date(&self, offset: &FixedOffset) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self.conn.prepare("SELECT start_time FROM activities")?;
        let rows = stmt.query_map([], |row| millis_column(row, 0))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            *counts.entry(day_key(&row?, offset)).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Delete an activity together with its events and raw records.
    pub fn delete_activity(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM activities WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    pub fn count_activities(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.conversation_id,
                message.role.as_str(),
                message.content,
                message.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Messages of a conversation in the order they were written.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, role, content, created_at FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            let role: String = row.get(2)?;
            Ok(ChatMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: ChatRole::parse(&role).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        Type::Text,
                        format!("unknown role: {role}").into(),
                    )
                })?,
                content: row.get(3)?,
                created_at: millis_column(row, 4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    let source_ids: String = row.get(7)?;
    let source_event_ids: BTreeSet<String> = serde_json::from_str(&source_ids)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(Activity {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        name: row.get(3)?,
        start_time: millis_column(row, 4)?,
        end_time: millis_column(row, 5)?,
        version: row.get::<_, i64>(6)?.max(0) as u64,
        source_event_ids,
        event_summaries: Vec::new(),
    })
}

// -- Async collaborator adapter --

/// Serves a shared `Database` to the stores. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteSource {
    db: Arc<Mutex<Database>>,
    utc_offset: FixedOffset,
}

impl SqliteSource {
    pub fn new(db: Arc<Mutex<Database>>, utc_offset: FixedOffset) -> Self {
        Self { db, utc_offset }
    }

    async fn with_db<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Database) -> Result<R> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let db = db
                .lock()
                .map_err(|e| CoreError::Source(format!("lock: {e}")))?;
            f(&db)
        })
        .await
        .map_err(|e| CoreError::Source(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl ActivitySource for SqliteSource {
    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<ActivityPage> {
        let activities = self
            .with_db(move |db| db.fetch_activity_page(limit, offset))
            .await?;
        Ok(ActivityPage { activities, offset })
    }

    async fn fetch_detail(&self, activity_id: &str) -> Result<Option<ActivityDetail>> {
        let id = activity_id.to_string();
        self.with_db(move |db| db.get_activity_detail(&id)).await
    }

    async fn fetch_counts_by_date(&self) -> Result<BTreeMap<String, usize>> {
        let offset = self.utc_offset;
        self.with_db(move |db| db.activity_counts_by_date(&offset))
            .await
    }

    async fn delete_activity(&self, activity_id: &str) -> Result<bool> {
        let id = activity_id.to_string();
        self.with_db(move |db| db.delete_activity(&id)).await
    }
}

#[async_trait]
impl MessageSource for SqliteSource {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let id = conversation_id.to_string();
        self.with_db(move |db| db.get_messages(&id)).await
    }
}
