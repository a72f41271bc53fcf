use anyhow::Result;
use rusqlite::params;

use super::types::{SessionRecord, SessionStatus};
use super::StateStore;

impl StateStore {
    pub async fn insert_session(
        &self,
        agent_id: &str,
        task_id: &str,
        container_id: Option<&str>,
    ) -> Result<SessionRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO sessions (id, agent_id, task_id, container_id, status, started_at) \
             VALUES (?1, ?2, ?3, ?4, 'starting', ?5)",
            params![id, agent_id, task_id, container_id, now],
        )?;
        Ok(SessionRecord {
            id,
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            container_id: container_id.map(str::to_string),
            status: SessionStatus::Starting,
            started_at: now,
            stopped_at: None,
        })
    }

    /// Moving into stopped/error stamps `stopped_at` once.
    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let now = super::now_iso();
        let stopped_at =
            matches!(status, SessionStatus::Stopped | SessionStatus::Error).then(|| now.clone());
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET status = ?1, stopped_at = COALESCE(stopped_at, ?2) WHERE id = ?3",
            params![status.as_str(), stopped_at, id],
        )?;
        Ok(())
    }

    pub async fn find_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, task_id, container_id, status, started_at, stopped_at \
             FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            let status: String = row.get(4)?;
            Ok(SessionRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                task_id: row.get(2)?,
                container_id: row.get(3)?,
                status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Error),
                started_at: row.get(5)?,
                stopped_at: row.get(6)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}
