//! Append-only schema migration list. Each entry runs at most once, inside
//! a transaction that also records the version in `schema_migrations`.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                direction TEXT NOT NULL DEFAULT 'inbound',
                external_id TEXT,
                from_addr TEXT NOT NULL,
                to_addrs TEXT NOT NULL DEFAULT '[]',
                subject TEXT,
                body TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'new',
                task_id TEXT,
                thread_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_messages_status ON messages(status);
            CREATE INDEX idx_messages_thread ON messages(thread_id);

            CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority TEXT NOT NULL DEFAULT 'normal',
                payload TEXT NOT NULL DEFAULT '{}',
                source_channel TEXT,
                source_message_id TEXT,
                agent_id TEXT,
                conductor_id TEXT,
                result TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX idx_tasks_status ON tasks(status);

            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                container_id TEXT,
                status TEXT NOT NULL DEFAULT 'starting',
                started_at TEXT NOT NULL,
                stopped_at TEXT
            );

            CREATE TABLE feedback (
                id TEXT PRIMARY KEY,
                task_id TEXT,
                agent_type TEXT,
                rating TEXT NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        sql: "
            CREATE TABLE prompt_versions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                version INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                activated_at TEXT,
                created_at TEXT NOT NULL,
                metrics TEXT
            );
            CREATE INDEX idx_prompt_versions_name ON prompt_versions(name);
        ",
    },
    Migration {
        version: 3,
        sql: "
            CREATE TABLE drafts (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                source_message_id TEXT,
                channel TEXT NOT NULL,
                to_addrs TEXT NOT NULL DEFAULT '[]',
                cc_addrs TEXT NOT NULL DEFAULT '[]',
                subject TEXT,
                body TEXT NOT NULL,
                original_body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending_review',
                priority TEXT NOT NULL DEFAULT 'normal',
                conductor_notes TEXT,
                quality_score INTEGER,
                quality_notes TEXT,
                auto_approve_match TEXT,
                reviewed_by TEXT,
                reviewed_at TEXT,
                sent_at TEXT,
                external_draft_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_drafts_status ON drafts(status);

            CREATE TABLE corrections (
                id TEXT PRIMARY KEY,
                draft_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                original_body TEXT NOT NULL,
                edited_body TEXT NOT NULL,
                edited_subject TEXT,
                change_type TEXT NOT NULL,
                feedback TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_corrections_draft ON corrections(draft_id);
        ",
    },
    Migration {
        version: 4,
        sql: "
            CREATE TABLE approval_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                agent_type TEXT,
                max_body_length INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
        ",
    },
];

/// Apply every unapplied migration in ascending version order. Each
/// migration commits atomically with its ledger row, so a crash leaves it
/// either fully applied or not at all.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            params![migration.version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("migration {} failed", migration.version))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, super::now_iso()],
        )?;
        tx.commit()?;
        info!("Applied schema migration {}", migration.version);
    }

    Ok(())
}
