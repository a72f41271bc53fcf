use anyhow::Result;
use rusqlite::{params, Row};
use tracing::warn;

use super::types::{AgentOutput, NewTask, TaskPriority, TaskRecord, TaskStatus};
use super::StateStore;

const TASK_COLUMNS: &str = "id, type, status, priority, payload, source_channel, \
     source_message_id, agent_id, conductor_id, result, retry_count, max_retries, \
     created_at, updated_at, completed_at";

fn map_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(2)?;
    let priority: String = row.get(3)?;
    let payload_raw: String = row.get(4)?;
    let result_raw: Option<String> = row.get(9)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        task_type: row.get(1)?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        priority: TaskPriority::from_str(&priority).unwrap_or(TaskPriority::Normal),
        payload: super::parse_json_column(&payload_raw),
        source_channel: row.get(5)?,
        source_message_id: row.get(6)?,
        agent_id: row.get(7)?,
        conductor_id: row.get(8)?,
        result: result_raw.and_then(|raw| serde_json::from_str::<AgentOutput>(&raw).ok()),
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

impl StateStore {
    pub async fn insert_task(&self, new: NewTask) -> Result<TaskRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO tasks (id, type, status, priority, payload, source_channel, \
                 source_message_id, conductor_id, max_retries, created_at, updated_at) \
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    new.task_type,
                    new.priority.as_str(),
                    super::encode_json(&new.payload),
                    new.source_channel,
                    new.source_message_id,
                    new.conductor_id,
                    new.max_retries,
                    now,
                ],
            )?;
        }
        self.find_task(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {} vanished after insert", id))
    }

    pub async fn find_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))?;
        let mut rows = stmt.query_map(params![id], map_task)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                warn!("Skipping malformed task row {}: {}", id, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Pending and queued tasks, priority-ordered then FIFO. This is the
    /// queue's restart-recovery read.
    pub async fn find_pending_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks WHERE status IN ('pending', 'queued') ORDER BY {} LIMIT ?1",
            TASK_COLUMNS,
            super::PRIORITY_ORDER
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_task)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed task row: {}", e),
            }
        }
        Ok(results)
    }

    pub async fn find_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], map_task)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed task row: {}", e),
            }
        }
        Ok(results)
    }

    /// Transition a task. Moving into a terminal status stamps
    /// `completed_at` once; the coalesce keeps earlier stamps intact.
    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let now = super::now_iso();
        let db = self.db.lock().await;
        if status.is_terminal() {
            db.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, \
                 completed_at = COALESCE(completed_at, ?2) WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        } else {
            db.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = NULL WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        }
        Ok(())
    }

    pub async fn set_task_result(&self, id: &str, result: &AgentOutput) -> Result<()> {
        let raw = serde_json::to_string(result)?;
        let db = self.db.lock().await;
        db.execute(
            "UPDATE tasks SET result = ?1, updated_at = ?2 WHERE id = ?3",
            params![raw, super::now_iso(), id],
        )?;
        Ok(())
    }

    pub async fn set_task_agent(&self, id: &str, agent_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE tasks SET agent_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![agent_id, super::now_iso(), id],
        )?;
        Ok(())
    }

    pub async fn update_task_payload(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE tasks SET payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![super::encode_json(payload), super::now_iso(), id],
        )?;
        Ok(())
    }

    pub async fn increment_task_retry(&self, id: &str) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2",
            params![super::now_iso(), id],
        )?;
        let count: i64 = db.query_row(
            "SELECT retry_count FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
