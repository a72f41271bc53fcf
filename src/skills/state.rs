//! On-disk state for the skill engine: the applied-skill ledger, the base
//! snapshot tree, and the transient pre-operation backup tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const STATE_DIR_NAME: &str = ".coreclaw";
pub const ENGINE_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedSkill {
    pub name: String,
    pub version: String,
    pub applied_at: String,
    /// Relative path -> SHA-256 hex of the file as applied.
    pub file_hashes: BTreeMap<String, String>,
    pub added_dependencies: BTreeMap<String, String>,
    pub added_env_vars: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillState {
    pub engine_version: String,
    pub applied: Vec<AppliedSkill>,
    #[serde(default)]
    pub custom_modifications: Vec<String>,
}

impl Default for SkillState {
    fn default() -> Self {
        Self {
            engine_version: ENGINE_VERSION.to_string(),
            applied: Vec::new(),
            custom_modifications: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupManifest {
    pub files: Vec<String>,
    pub created_at: String,
}

/// Path helpers rooted at one project tree.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn base_dir(&self) -> PathBuf {
        self.state_dir().join("base")
    }

    pub fn base_path(&self, rel: &str) -> PathBuf {
        self.base_dir().join(rel)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir().join("backup")
    }

    pub fn backup_path(&self, rel: &str) -> PathBuf {
        self.backup_dir().join(rel)
    }

    pub fn backup_manifest(&self) -> PathBuf {
        self.backup_dir().join("_manifest.json")
    }

    pub fn project_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub async fn load_state(&self) -> Result<SkillState> {
        let path = self.state_file();
        if !path.exists() {
            return Ok(SkillState::default());
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read skill state {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("malformed skill state {:?}", path))
    }

    pub async fn save_state(&self, state: &SkillState) -> Result<()> {
        fs::create_dir_all(self.state_dir()).await?;
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(self.state_file(), raw).await?;
        Ok(())
    }

    /// Snapshot every listed project file (that exists) into `backup/` and
    /// write the manifest. The manifest lists all touched files, existing
    /// or not, so a restore can also delete files the operation created.
    pub async fn backup_files(&self, files: &[String]) -> Result<()> {
        let backup_dir = self.backup_dir();
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir).await?;
        }
        fs::create_dir_all(&backup_dir).await?;

        for rel in files {
            let source = self.project_path(rel);
            if source.exists() {
                let dest = self.backup_path(rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&source, &dest)
                    .await
                    .with_context(|| format!("failed to back up {:?}", source))?;
            }
        }

        let manifest = BackupManifest {
            files: files.to_vec(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        fs::write(
            self.backup_manifest(),
            serde_json::to_string_pretty(&manifest)?,
        )
        .await?;
        Ok(())
    }

    /// Put every file in the backup manifest back the way it was: restore
    /// backed-up copies, delete files that did not exist before.
    pub async fn restore_backup(&self) -> Result<()> {
        let manifest_path = self.backup_manifest();
        if !manifest_path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&manifest_path).await?;
        let manifest: BackupManifest = serde_json::from_str(&raw)
            .with_context(|| format!("malformed backup manifest {:?}", manifest_path))?;

        for rel in &manifest.files {
            let target = self.project_path(rel);
            let backup = self.backup_path(rel);
            if backup.exists() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&backup, &target)
                    .await
                    .with_context(|| format!("failed to restore {:?}", target))?;
            } else if target.exists() {
                fs::remove_file(&target).await?;
                prune_empty_dirs(&self.root, &target).await;
            }
        }
        self.clear_backup().await
    }

    pub async fn clear_backup(&self) -> Result<()> {
        let backup_dir = self.backup_dir();
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir).await?;
        }
        Ok(())
    }
}

/// Remove now-empty ancestor directories of `path`, stopping at (and never
/// removing) `root`.
pub async fn prune_empty_dirs(root: &Path, path: &Path) {
    let mut current = path.parent().map(Path::to_path_buf);
    while let Some(dir) = current {
        if dir == *root || !dir.starts_with(root) {
            break;
        }
        match std::fs::read_dir(&dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        if fs::remove_dir(&dir).await.is_err() {
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}
