use anyhow::Result;
use rusqlite::{params, Row};
use tracing::warn;

use super::types::{PromptMetrics, PromptVersionRecord};
use super::StateStore;

const PROMPT_COLUMNS: &str =
    "id, name, content, version, active, activated_at, created_at, metrics";

fn map_prompt(row: &Row<'_>) -> rusqlite::Result<PromptVersionRecord> {
    let active: i64 = row.get(4)?;
    let metrics_raw: Option<String> = row.get(7)?;
    Ok(PromptVersionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        version: row.get(3)?,
        active: active != 0,
        activated_at: row.get(5)?,
        created_at: row.get(6)?,
        metrics: metrics_raw.and_then(|raw| serde_json::from_str::<PromptMetrics>(&raw).ok()),
    })
}

impl StateStore {
    /// Create the next version under `name` (starting at 1), inactive.
    pub async fn create_prompt_version(
        &self,
        name: &str,
        content: &str,
    ) -> Result<PromptVersionRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        {
            let db = self.db.lock().await;
            let next: i64 = db.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_versions WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            db.execute(
                "INSERT INTO prompt_versions (id, name, content, version, active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![id, name, content, next, now],
            )?;
        }
        self.find_prompt_version(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("prompt version {} vanished after insert", id))
    }

    pub async fn find_prompt_version(&self, id: &str) -> Result<Option<PromptVersionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM prompt_versions WHERE id = ?1",
            PROMPT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id], map_prompt)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                warn!("Skipping malformed prompt version row {}: {}", id, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn find_active_prompt(&self, name: &str) -> Result<Option<PromptVersionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM prompt_versions WHERE name = ?1 AND active = 1",
            PROMPT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![name], map_prompt)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                warn!("Skipping malformed prompt version row for {}: {}", name, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn list_prompt_versions(&self, name: &str) -> Result<Vec<PromptVersionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM prompt_versions WHERE name = ?1 ORDER BY version ASC",
            PROMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![name], map_prompt)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed prompt version row: {}", e),
            }
        }
        Ok(results)
    }

    /// Activate one version and deactivate its siblings in a single
    /// transaction; any error rolls the whole switch back.
    pub async fn activate_prompt_version(&self, id: &str) -> Result<PromptVersionRecord> {
        let now = super::now_iso();
        {
            let mut db = self.db.lock().await;
            let tx = db.transaction()?;
            let name: String = tx.query_row(
                "SELECT name FROM prompt_versions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE prompt_versions SET active = 0 WHERE name = ?1",
                params![name],
            )?;
            tx.execute(
                "UPDATE prompt_versions SET active = 1, activated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            tx.commit()?;
        }
        self.find_prompt_version(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("prompt version {} not found after activate", id))
    }

    pub async fn update_prompt_metrics(&self, id: &str, metrics: &PromptMetrics) -> Result<()> {
        let raw = serde_json::to_string(metrics)?;
        let db = self.db.lock().await;
        db.execute(
            "UPDATE prompt_versions SET metrics = ?1 WHERE id = ?2",
            params![raw, id],
        )?;
        Ok(())
    }
}
