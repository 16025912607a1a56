pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod inflight;
pub mod ingest;
pub mod schema;
pub mod source;
pub mod store;
pub mod timeline;

pub use config::AppConfig;
pub use db::{Database, SqliteSource};
pub use error::{CoreError, Result};
pub use store::Store;
