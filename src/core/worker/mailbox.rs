//! Filesystem mailbox for messaging a running worker. Files land in the
//! worker's `input/` directory via write-to-tmp-then-rename so the child
//! never observes a half-written message.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

/// Sentinel filename: a zero-byte file asking the child to exit cleanly.
pub const CLOSE_SENTINEL: &str = "_close";

#[derive(Debug, Serialize)]
struct MailboxMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

/// Atomically drop a follow-up message into `input_dir`.
pub async fn drop_message(input_dir: &Path, text: &str) -> Result<()> {
    let name = uuid::Uuid::new_v4().to_string();
    let tmp_path = input_dir.join(format!(".{}.tmp", name));
    let final_path = input_dir.join(format!("{}.json", name));

    let body = serde_json::to_vec(&MailboxMessage {
        kind: "message",
        text,
    })?;
    fs::write(&tmp_path, body)
        .await
        .with_context(|| format!("failed to write mailbox tmp file {:?}", tmp_path))?;
    fs::rename(&tmp_path, &final_path)
        .await
        .with_context(|| format!("failed to publish mailbox file {:?}", final_path))?;
    Ok(())
}

/// Ask the child to terminate cleanly.
pub async fn signal_close(input_dir: &Path) -> Result<()> {
    let path = input_dir.join(CLOSE_SENTINEL);
    fs::write(&path, b"")
        .await
        .with_context(|| format!("failed to write close sentinel {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_message_is_complete_json_with_no_tmp_left() {
        let dir = tempfile::tempdir().unwrap();
        drop_message(dir.path(), "please also cc legal").await.unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
        assert!(!names[0].starts_with('.'));

        let content = fs::read_to_string(dir.path().join(&names[0])).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["text"], "please also cc legal");
    }

    #[tokio::test]
    async fn close_sentinel_is_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        signal_close(dir.path()).await.unwrap();
        let meta = fs::metadata(dir.path().join(CLOSE_SENTINEL)).await.unwrap();
        assert_eq!(meta.len(), 0);
    }
}
