use anyhow::Result;
use rusqlite::{params, Row};
use tracing::warn;

use super::types::{ChangeType, CorrectionRecord, FeedbackRecord, NewCorrection};
use super::StateStore;

fn map_correction(row: &Row<'_>) -> rusqlite::Result<CorrectionRecord> {
    let change_type: String = row.get(6)?;
    Ok(CorrectionRecord {
        id: row.get(0)?,
        draft_id: row.get(1)?,
        task_id: row.get(2)?,
        original_body: row.get(3)?,
        edited_body: row.get(4)?,
        edited_subject: row.get(5)?,
        change_type: ChangeType::from_str(&change_type).unwrap_or(ChangeType::MinorEdit),
        feedback: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl StateStore {
    pub async fn insert_correction(&self, new: NewCorrection) -> Result<CorrectionRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO corrections (id, draft_id, task_id, original_body, edited_body, \
             edited_subject, change_type, feedback, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.draft_id,
                new.task_id,
                new.original_body,
                new.edited_body,
                new.edited_subject,
                new.change_type.as_str(),
                new.feedback,
                now,
            ],
        )?;
        Ok(CorrectionRecord {
            id,
            draft_id: new.draft_id,
            task_id: new.task_id,
            original_body: new.original_body,
            edited_body: new.edited_body,
            edited_subject: new.edited_subject,
            change_type: new.change_type,
            feedback: new.feedback,
            created_at: now,
        })
    }

    /// Most recent corrections, newest first. The learning analyser's feed.
    pub async fn recent_corrections(&self, limit: usize) -> Result<Vec<CorrectionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, draft_id, task_id, original_body, edited_body, edited_subject, \
             change_type, feedback, created_at \
             FROM corrections ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_correction)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed correction row: {}", e),
            }
        }
        Ok(results)
    }

    // --- Feedback ---

    pub async fn insert_feedback(
        &self,
        task_id: Option<&str>,
        agent_type: Option<&str>,
        rating: &str,
        comment: Option<&str>,
    ) -> Result<FeedbackRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO feedback (id, task_id, agent_type, rating, comment, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, task_id, agent_type, rating, comment, now],
        )?;
        Ok(FeedbackRecord {
            id,
            task_id: task_id.map(str::to_string),
            agent_type: agent_type.map(str::to_string),
            rating: rating.to_string(),
            comment: comment.map(str::to_string),
            created_at: now,
        })
    }
}
