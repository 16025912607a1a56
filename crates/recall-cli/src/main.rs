mod replay;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use recall_core::chat::{ChatStore, Completion, SendOutcome};
use recall_core::config::{init_logging, AppConfig};
use recall_core::db::{Database, SqliteSource};
use recall_core::ingest::RawActivity;
use recall_core::schema::Activity;
use recall_core::source::ActivitySource;
use recall_core::timeline::{LoadOutcome, TimelineStore};
use tracing::{info, warn};

use crate::replay::ReplayBackend;

#[derive(Parser)]
#[command(name = "recall", about = "Browse the activity timeline and chat history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the newest days of the timeline (default when no subcommand given)
    Timeline {
        /// Activities per page; defaults to the configured page size
        #[arg(long)]
        page_size: Option<usize>,
        /// Number of pages to load
        #[arg(long, default_value = "1")]
        pages: usize,
    },
    /// Print activity totals per date
    Counts,
    /// Print the events and raw records behind an activity
    Detail { id: String },
    /// Import activities from a JSON array
    Import { file: PathBuf },
    /// Delete an activity
    Remove { id: String },
    /// Print the stored messages of a conversation
    Messages { conversation: String },
    /// Stream the contents of a file as an assistant reply
    Replay {
        conversation: String,
        file: PathBuf,
        /// Message sent on the user's behalf
        #[arg(long, default_value = "replay")]
        prompt: String,
        /// Characters per streamed fragment
        #[arg(long, default_value = "4")]
        chunk_chars: usize,
        /// Delay between fragments in milliseconds
        #[arg(long, default_value = "5")]
        delay_ms: u64,
    },
}

struct App {
    config: AppConfig,
    db: Arc<Mutex<Database>>,
    source: SqliteSource,
}

impl App {
    fn open() -> anyhow::Result<Self> {
        let config = AppConfig::load()?;
        config.ensure_dirs()?;
        let db_path = config.db_path()?;
        let db = Database::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        let db = Arc::new(Mutex::new(db));
        let source = SqliteSource::new(Arc::clone(&db), config.timeline.utc_offset()?);
        info!("database opened at {}", db_path.display());
        Ok(Self { config, db, source })
    }

    fn timeline(&self) -> anyhow::Result<TimelineStore> {
        Ok(TimelineStore::new(
            Arc::new(self.source.clone()),
            &self.config.timeline,
        )?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let app = App::open()?;

    match cli.command.unwrap_or(Command::Timeline {
        page_size: None,
        pages: 1,
    }) {
        Command::Timeline { page_size, pages } => run_timeline(&app, page_size, pages).await,
        Command::Counts => run_counts(&app).await,
        Command::Detail { id } => run_detail(&app, &id).await,
        Command::Import { file } => run_import(&app, &file),
        Command::Remove { id } => run_remove(&app, &id).await,
        Command::Messages { conversation } => run_messages(&app, &conversation).await,
        Command::Replay {
            conversation,
            file,
            prompt,
            chunk_chars,
            delay_ms,
        } => {
            run_replay(
                &app,
                &conversation,
                &file,
                &prompt,
                chunk_chars,
                Duration::from_millis(delay_ms),
            )
            .await
        }
    }
}

async fn run_timeline(app: &App, page_size: Option<usize>, pages: usize) -> anyhow::Result<()> {
    let timeline = app.timeline()?;
    let page_size = page_size.unwrap_or(app.config.timeline.page_size).max(1);

    if let LoadOutcome::Failed = timeline.initialize(page_size).await {
        let error = timeline.snapshot().error.unwrap_or_default();
        anyhow::bail!("failed to load timeline: {error}");
    }
    for _ in 1..pages {
        if !timeline.snapshot().window.has_more_bottom() {
            break;
        }
        if let LoadOutcome::Failed = timeline.load_more_bottom(page_size).await {
            warn!("stopped paging after a failed load");
            break;
        }
    }
    timeline.refresh_counts().await;

    let state = timeline.snapshot();
    let offset = app.config.timeline.utc_offset()?;
    for day in state.window.days() {
        let total = state.day_counts.get(&day.date).copied().unwrap_or(day.activities.len());
        println!("{} ({} shown, {} total)", day.date, day.activities.len(), total);
        for activity in &day.activities {
            print_activity(activity, &offset);
        }
    }
    if state.window.has_more_bottom() {
        println!("... more available (--pages {})", pages + 1);
    }
    Ok(())
}

fn print_activity(activity: &Activity, offset: &chrono::FixedOffset) {
    let start = activity.start_time.with_timezone(offset);
    let end = activity.end_time.with_timezone(offset);
    println!(
        "  {}-{}  {}  [{}]",
        start.format("%H:%M"),
        end.format("%H:%M"),
        activity.title,
        activity.id
    );
}

async fn run_counts(app: &App) -> anyhow::Result<()> {
    let counts = app.source.fetch_counts_by_date().await?;
    if counts.is_empty() {
        println!("no activities");
    }
    for (date, count) in counts.iter().rev() {
        println!("{date}  {count}");
    }
    Ok(())
}

async fn run_detail(app: &App, id: &str) -> anyhow::Result<()> {
    match app.source.fetch_detail(id).await? {
        Some(detail) => println!("{}", serde_json::to_string_pretty(&detail)?),
        None => anyhow::bail!("no activity with id {id}"),
    }
    Ok(())
}

fn run_import(app: &App, file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let raw: Vec<RawActivity> = serde_json::from_str(&text)?;

    let db = app
        .db
        .lock()
        .map_err(|e| anyhow::anyhow!("database lock poisoned: {e}"))?;
    let mut imported = 0usize;
    let mut skipped = 0usize;
    for entry in raw {
        let id = entry.id.clone();
        match Activity::try_from(entry) {
            Ok(activity) => {
                db.upsert_activity(&activity)?;
                imported += 1;
            }
            Err(e) => {
                warn!(id = %id, "skipping activity: {e}");
                skipped += 1;
            }
        }
    }
    info!(imported, skipped, "import complete");
    println!("imported {imported}, skipped {skipped}");
    Ok(())
}

async fn run_remove(app: &App, id: &str) -> anyhow::Result<()> {
    let timeline = app.timeline()?;
    if !timeline.delete_activity(id).await {
        anyhow::bail!("activity {id} was not deleted");
    }
    println!("deleted {id}");
    Ok(())
}

async fn run_messages(app: &App, conversation: &str) -> anyhow::Result<()> {
    let chat = chat_store(app, None);
    if !chat.load_messages(conversation).await {
        let error = chat.snapshot().error.unwrap_or_default();
        anyhow::bail!("failed to load messages: {error}");
    }
    for message in chat.messages(conversation) {
        println!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.role.as_str(),
            message.content
        );
    }
    Ok(())
}

fn chat_store(app: &App, backend: Option<ReplayBackend>) -> ChatStore {
    let backend = backend.unwrap_or_else(|| {
        ReplayBackend::new(Arc::clone(&app.db), String::new(), 1, Duration::ZERO)
    });
    ChatStore::new(
        Arc::new(backend),
        Arc::new(app.source.clone()),
        &app.config.chat,
    )
}

async fn run_replay(
    app: &App,
    conversation: &str,
    file: &Path,
    prompt: &str,
    chunk_chars: usize,
    delay: Duration,
) -> anyhow::Result<()> {
    let reply = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let backend = ReplayBackend::new(Arc::clone(&app.db), reply, chunk_chars, delay);
    let chat = chat_store(app, Some(backend));
    chat.load_messages(conversation).await;

    // Print each flush as it lands; the store coalesces fragments per frame.
    let printed = Arc::new(AtomicUsize::new(0));
    let printer = {
        let chat = chat.clone();
        let conversation = conversation.to_string();
        let printed = Arc::clone(&printed);
        let mut changes = chat.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let streaming = chat
                    .snapshot()
                    .streaming
                    .get(&conversation)
                    .cloned()
                    .unwrap_or_default();
                print_from(&streaming, &printed);
            }
        })
    };

    let send = chat.send_message(conversation, prompt, Vec::new(), None);
    tokio::pin!(send);
    let outcome = tokio::select! {
        outcome = &mut send => outcome,
        _ = tokio::signal::ctrl_c() => {
            chat.cancel(conversation).await;
            send.await
        }
    };
    printer.abort();

    match outcome {
        SendOutcome::Completed(Completion::Committed(message)) => {
            // The final flush and the commit can land in one notification.
            print_from(&message.content, &printed);
            println!();
            info!(message_id = %message.id, "reply committed");
        }
        SendOutcome::Completed(Completion::Recovered(count)) => {
            println!();
            println!("no text streamed; reloaded {count} messages");
        }
        SendOutcome::Completed(Completion::Failed(error)) | SendOutcome::Failed(error) => {
            println!();
            anyhow::bail!("send failed: {error}");
        }
        SendOutcome::Cancelled => println!("\ncancelled"),
        SendOutcome::Suppressed => println!("a send is already in flight"),
    }
    Ok(())
}

/// Print whatever part of `text` has not been printed yet.
fn print_from(text: &str, printed: &AtomicUsize) {
    let from = printed.load(Ordering::Relaxed);
    if let Some(rest) = text.get(from..).filter(|rest| !rest.is_empty()) {
        print!("{rest}");
        let _ = std::io::stdout().flush();
        printed.store(text.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_from_advances_past_printed_text() {
        let printed = AtomicUsize::new(0);
        print_from("hé", &printed);
        assert_eq!(printed.load(Ordering::Relaxed), "hé".len());

        print_from("héllo", &printed);
        assert_eq!(printed.load(Ordering::Relaxed), "héllo".len());

        // shorter text after a reset prints nothing
        print_from("h", &printed);
        assert_eq!(printed.load(Ordering::Relaxed), "héllo".len());
    }

    #[test]
    fn test_print_from_ignores_offset_inside_a_char() {
        // byte 3 falls inside the second 'é'
        let printed = AtomicUsize::new(3);
        print_from("ééé", &printed);
        assert_eq!(printed.load(Ordering::Relaxed), 3);
    }
}
