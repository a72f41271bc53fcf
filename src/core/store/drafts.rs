use anyhow::Result;
use rusqlite::{params, Row};
use tracing::warn;

use super::types::{ApprovalRuleRecord, DraftRecord, DraftStatus, NewDraft, TaskPriority};
use super::StateStore;

const DRAFT_COLUMNS: &str = "id, task_id, source_message_id, channel, to_addrs, cc_addrs, \
     subject, body, original_body, status, priority, conductor_notes, quality_score, \
     quality_notes, auto_approve_match, reviewed_by, reviewed_at, sent_at, \
     external_draft_id, metadata, created_at, updated_at";

fn map_draft(row: &Row<'_>) -> rusqlite::Result<DraftRecord> {
    let to_raw: String = row.get(4)?;
    let cc_raw: String = row.get(5)?;
    let status: String = row.get(9)?;
    let priority: String = row.get(10)?;
    let metadata_raw: String = row.get(19)?;
    Ok(DraftRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        source_message_id: row.get(2)?,
        channel: row.get(3)?,
        to: super::parse_string_list(&to_raw),
        cc: super::parse_string_list(&cc_raw),
        subject: row.get(6)?,
        body: row.get(7)?,
        original_body: row.get(8)?,
        status: DraftStatus::from_str(&status).unwrap_or(DraftStatus::PendingReview),
        priority: TaskPriority::from_str(&priority).unwrap_or(TaskPriority::Normal),
        conductor_notes: row.get(11)?,
        quality_score: row.get(12)?,
        quality_notes: row.get(13)?,
        auto_approve_match: row.get(14)?,
        reviewed_by: row.get(15)?,
        reviewed_at: row.get(16)?,
        sent_at: row.get(17)?,
        external_draft_id: row.get(18)?,
        metadata: super::parse_json_column(&metadata_raw),
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

impl StateStore {
    /// Insert a draft. `original_body` is frozen to the creation-time body
    /// and never updated afterwards.
    pub async fn insert_draft(&self, new: NewDraft) -> Result<DraftRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO drafts (id, task_id, source_message_id, channel, to_addrs, \
                 cc_addrs, subject, body, original_body, status, priority, conductor_notes, \
                 metadata, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 'pending_review', ?9, ?10, ?11, ?12, ?12)",
                params![
                    id,
                    new.task_id,
                    new.source_message_id,
                    new.channel,
                    super::encode_string_list(&new.to),
                    super::encode_string_list(&new.cc),
                    new.subject,
                    new.body,
                    new.priority.as_str(),
                    new.conductor_notes,
                    super::encode_json(&new.metadata),
                    now,
                ],
            )?;
        }
        self.find_draft(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("draft {} vanished after insert", id))
    }

    pub async fn find_draft(&self, id: &str) -> Result<Option<DraftRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM drafts WHERE id = ?1",
            DRAFT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id], map_draft)?;
        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                warn!("Skipping malformed draft row {}: {}", id, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Drafts awaiting human action, priority-ordered then FIFO.
    pub async fn find_drafts_pending_review(&self, limit: usize) -> Result<Vec<DraftRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM drafts WHERE status = 'pending_review' ORDER BY {} LIMIT ?1",
            DRAFT_COLUMNS,
            super::PRIORITY_ORDER
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_draft)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed draft row: {}", e),
            }
        }
        Ok(results)
    }

    pub async fn recent_drafts(&self, limit: usize) -> Result<Vec<DraftRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM drafts ORDER BY created_at DESC LIMIT ?1",
            DRAFT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_draft)?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed draft row: {}", e),
            }
        }
        Ok(results)
    }

    /// Transition a draft. Review-like statuses stamp `reviewed_at`,
    /// sent-like statuses stamp `sent_at`; coalesce keeps earlier stamps.
    pub async fn update_draft_status(
        &self,
        id: &str,
        status: DraftStatus,
        reviewed_by: Option<&str>,
    ) -> Result<()> {
        let now = super::now_iso();
        let reviewed_at = status.is_reviewed().then(|| now.clone());
        let sent_at = status.is_sent_like().then(|| now.clone());
        let db = self.db.lock().await;
        db.execute(
            "UPDATE drafts SET status = ?1, updated_at = ?2, \
             reviewed_by = COALESCE(?3, reviewed_by), \
             reviewed_at = COALESCE(reviewed_at, ?4), \
             sent_at = COALESCE(sent_at, ?5) \
             WHERE id = ?6",
            params![status.as_str(), now, reviewed_by, reviewed_at, sent_at, id],
        )?;
        Ok(())
    }

    /// Rewrite body and optionally subject; `original_body` is untouched.
    pub async fn update_draft_body(
        &self,
        id: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE drafts SET body = ?1, subject = COALESCE(?2, subject), updated_at = ?3 \
             WHERE id = ?4",
            params![body, subject, super::now_iso(), id],
        )?;
        Ok(())
    }

    pub async fn update_draft_quality(
        &self,
        id: &str,
        score: i64,
        notes: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE drafts SET quality_score = ?1, quality_notes = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![score, notes, super::now_iso(), id],
        )?;
        Ok(())
    }

    pub async fn set_draft_auto_approve_match(&self, id: &str, rule_name: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE drafts SET auto_approve_match = ?1, updated_at = ?2 WHERE id = ?3",
            params![rule_name, super::now_iso(), id],
        )?;
        Ok(())
    }

    // --- Approval rules ---

    pub async fn insert_approval_rule(
        &self,
        name: &str,
        agent_type: Option<&str>,
        max_body_length: Option<i64>,
    ) -> Result<ApprovalRuleRecord> {
        let id = super::new_id();
        let now = super::now_iso();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO approval_rules (id, name, agent_type, max_body_length, enabled, created_at) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![id, name, agent_type, max_body_length, now],
        )?;
        Ok(ApprovalRuleRecord {
            id,
            name: name.to_string(),
            agent_type: agent_type.map(str::to_string),
            max_body_length,
            enabled: true,
            created_at: now,
        })
    }

    pub async fn find_enabled_approval_rules(&self) -> Result<Vec<ApprovalRuleRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, agent_type, max_body_length, enabled, created_at \
             FROM approval_rules WHERE enabled = 1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let enabled: i64 = row.get(4)?;
            Ok(ApprovalRuleRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                agent_type: row.get(2)?,
                max_body_length: row.get(3)?,
                enabled: enabled != 0,
                created_at: row.get(5)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => warn!("Skipping malformed approval rule row: {}", e),
            }
        }
        Ok(results)
    }
}
