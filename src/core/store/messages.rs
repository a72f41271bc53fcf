use anyhow::Result;
use rusqlite::{params, Row};
use tracing::warn;

use super::types::{MessageDirection, MessageRecord, MessageStatus, NewMessage};
use super::StateStore;

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let direction: String = row.get(2)?;
    let to_raw: String = row.get(5)?;
    let metadata_raw: String = row.get(8)?;
    let status: String = row.get(9)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        channel: row.get(1)?,
        direction: MessageDirection::from_str(&direction).unwrap_or(MessageDirection::Inbound),
        external_id: row.get(3)?,
        from: row.get(4)?,
        to: super::parse_string_list(&to_raw),
        subject: row.get(6)?,
        body: row.get(7)?,
        metadata: super::parse_json_column(&metadata_raw),
        status: MessageStatus::from_str(&status).unwrap_or(MessageStatus::New),
        task_id: row.get(10)?,
        thread_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, channel, direction, external_id, from_addr, to_addrs, \
     subject, body, metadata, status, task_id, thread_id, created_at, updated_at";

impl StateStore {
    pub async fn insert_message(&self, new: NewMessage) -> Result<MessageRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        let direction = new.direction.unwrap_or(MessageDirection::Inbound);
        let metadata = new.metadata.unwrap_or_else(|| serde_json::json!({}));
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO messages (id, channel, direction, external_id, from_addr, to_addrs, \
                 subject, body, metadata, status, thread_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'new', ?10, ?11, ?11)",
                params![
                    id,
                    new.channel,
                    direction.as_str(),
                    new.external_id,
                    new.from,
                    super::encode_string_list(&new.to),
                    new.subject,
                    new.body,
                    super::encode_json(&metadata),
                    new.thread_id,
                    now,
                ],
            )?;
        }
        self.find_message(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("message {} vanished after insert", id))
    }

    pub async fn find_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM messages WHERE id = ?1",
            MESSAGE_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id], map_message)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                warn!("Skipping malformed message row {}: {}", id, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Messages in a given status, most recent first.
    pub async fn find_messages_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM messages WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], map_message)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed message row: {}", e),
            }
        }
        Ok(results)
    }

    pub async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), super::now_iso(), id],
        )?;
        Ok(())
    }

    /// Record the task created for this message (weak back-reference).
    pub async fn link_message_task(&self, id: &str, task_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE messages SET task_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![task_id, super::now_iso(), id],
        )?;
        Ok(())
    }
}
