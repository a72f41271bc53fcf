//! Typed repository layer over a single SQLite file. One connection behind
//! a mutex; prepared statements; JSON-shaped columns stored as strings.

mod corrections;
mod drafts;
mod messages;
mod migrations;
mod prompts;
mod sessions;
mod tasks;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

pub use types::*;

/// Environment variable observed by the core: overrides the store path.
pub const STORE_PATH_ENV: &str = "CORECLAW_DB";

pub struct StateStore {
    db: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the store at `path`, enable WAL and foreign keys,
    /// and bring the schema up to date. Failure here is fatal to startup.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut conn = Connection::open(&path)
            .with_context(|| format!("failed to open state store at {:?}", path))?;
        Self::configure(&mut conn)?;
        info!("State store ready at {:?}", path);
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&mut conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &mut Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(conn).context("schema migration failed")?;
        Ok(())
    }

    /// Applied migration versions, ascending. Exposed for diagnostics.
    pub async fn schema_versions(&self) -> Result<Vec<i64>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }
}

pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parse a JSON column, tolerating malformed rows (log-and-default policy).
pub(crate) fn parse_json_column(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!("Malformed JSON column, substituting empty object: {}", e);
        serde_json::json!({})
    })
}

/// Parse a JSON string-array column (recipient lists).
pub(crate) fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn encode_json(value: &serde_json::Value) -> String {
    value.to_string()
}

pub(crate) fn encode_string_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

/// Shared `ORDER BY` fragment: priority rank then FIFO.
pub(crate) const PRIORITY_ORDER: &str = "CASE priority \
     WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END, \
     created_at ASC";
