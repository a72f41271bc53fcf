//! Skill engine: validates, snapshots, applies, merges, records and
//! uninstalls extension packs against a project tree. Every apply is
//! all-or-nothing: any failure restores the pre-apply state from the
//! transient backup. The one deliberate exception is merge conflicts,
//! which are reported but leave the (marker-bearing) result in place.

pub mod merge;
pub mod state;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};

pub use state::{AppliedSkill, SkillState};

use merge::three_way_merge;
use state::StatePaths;

pub const MANIFEST_FILE: &str = "manifest.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Delete,
    Rename,
    Move,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileOp {
    pub op: FileOpKind,
    pub path: String,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    #[serde(rename = "skill")]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Files to add; sources live under `<skill>/add/<relpath>`.
    #[serde(default)]
    pub adds: Vec<String>,
    /// Files to merge; sources live under `<skill>/modify/<relpath>`.
    #[serde(default)]
    pub modifies: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Package dependencies to merge into the project manifest.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Environment variable names to append to the env example file.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub post_apply: Vec<String>,
    /// Pre-merge deletes/renames/moves against the project tree.
    #[serde(default)]
    pub file_ops: Vec<FileOp>,
}

#[derive(Debug, Clone)]
pub struct SkillEngineConfig {
    /// Project manifest that receives merged package dependencies.
    pub package_file: String,
    pub env_example_file: String,
    /// Run after dependencies were added; failure aborts and rolls back.
    pub install_command: Option<String>,
}

impl Default for SkillEngineConfig {
    fn default() -> Self {
        Self {
            package_file: "package.json".to_string(),
            env_example_file: ".env.example".to_string(),
            install_command: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub success: bool,
    pub skill: String,
    pub version: String,
    pub conflicts: Vec<String>,
    pub message: String,
}

pub struct SkillEngine {
    root: PathBuf,
    paths: StatePaths,
    config: SkillEngineConfig,
}

impl SkillEngine {
    pub fn new(project_root: &Path, config: SkillEngineConfig) -> Self {
        Self {
            root: project_root.to_path_buf(),
            paths: StatePaths::new(project_root),
            config,
        }
    }

    pub async fn applied_skills(&self) -> Result<Vec<AppliedSkill>> {
        Ok(self.paths.load_state().await?.applied)
    }

    /// Apply the skill at `skill_dir`. On any error in the mutation steps
    /// the project is restored from backup and the error is returned; a
    /// merge conflict is not an error but flips `success` off.
    pub async fn apply(&self, skill_dir: &Path) -> Result<ApplyOutcome> {
        let manifest = read_manifest(skill_dir).await?;
        validate_paths(&manifest)?;
        let mut state = self.paths.load_state().await?;

        self.preflight(&manifest, &state)?;

        let touched = self.touched_files(&manifest);
        self.paths.backup_files(&touched).await?;

        match self.apply_steps(skill_dir, &manifest).await {
            Ok(conflicts) => {
                let mut file_hashes = BTreeMap::new();
                for rel in touched
                    .iter()
                    .filter(|rel| manifest.adds.contains(*rel) || manifest.modifies.contains(*rel))
                {
                    let path = self.paths.project_path(rel);
                    if path.exists() {
                        file_hashes.insert(rel.clone(), hash_file(&path).await?);
                    }
                }
                state.applied.push(AppliedSkill {
                    name: manifest.name.clone(),
                    version: manifest.version.clone(),
                    applied_at: chrono::Utc::now().to_rfc3339(),
                    file_hashes,
                    added_dependencies: manifest.dependencies.clone(),
                    added_env_vars: manifest.env.clone(),
                });
                self.paths.save_state(&state).await?;
                self.paths.clear_backup().await?;

                let success = conflicts.is_empty();
                let message = if success {
                    format!("skill {} {} applied", manifest.name, manifest.version)
                } else {
                    format!(
                        "skill {} {} applied with {} merge conflict(s)",
                        manifest.name,
                        manifest.version,
                        conflicts.len()
                    )
                };
                info!("{}", message);
                Ok(ApplyOutcome {
                    success,
                    skill: manifest.name,
                    version: manifest.version,
                    conflicts,
                    message,
                })
            }
            Err(e) => {
                warn!("Skill {} apply failed, rolling back: {}", manifest.name, e);
                if let Err(restore_err) = self.paths.restore_backup().await {
                    warn!(
                        "Rollback of skill {} hit an error: {}",
                        manifest.name, restore_err
                    );
                }
                Err(e)
            }
        }
    }

    fn preflight(&self, manifest: &SkillManifest, state: &SkillState) -> Result<()> {
        let mut errors = Vec::new();
        if state.applied.iter().any(|s| s.name == manifest.name) {
            errors.push(format!("skill {} is already applied", manifest.name));
        }
        for dep in &manifest.depends {
            if !state.applied.iter().any(|s| &s.name == dep) {
                errors.push(format!("missing dependency: {}", dep));
            }
        }
        for conflict in &manifest.conflicts {
            if state.applied.iter().any(|s| &s.name == conflict) {
                errors.push(format!("conflicts with applied skill: {}", conflict));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            bail!("pre-flight failed: {}", errors.join("; "))
        }
    }

    /// Everything the apply may rewrite, so the backup can undo all of it.
    fn touched_files(&self, manifest: &SkillManifest) -> Vec<String> {
        let mut touched: Vec<String> = Vec::new();
        touched.extend(manifest.adds.iter().cloned());
        touched.extend(manifest.modifies.iter().cloned());
        for op in &manifest.file_ops {
            touched.push(op.path.clone());
            if let Some(to) = &op.to {
                touched.push(to.clone());
            }
        }
        if !manifest.dependencies.is_empty() {
            touched.push(self.config.package_file.clone());
        }
        if !manifest.env.is_empty() {
            touched.push(self.config.env_example_file.clone());
        }
        touched.sort();
        touched.dedup();
        touched
    }

    /// Steps 3-7 of the apply algorithm. Returns merge-conflict paths.
    async fn apply_steps(
        &self,
        skill_dir: &Path,
        manifest: &SkillManifest,
    ) -> Result<Vec<String>> {
        // 3. file_ops
        for op in &manifest.file_ops {
            let from = self.paths.project_path(&op.path);
            match op.op {
                FileOpKind::Delete => {
                    if from.exists() {
                        fs::remove_file(&from)
                            .await
                            .with_context(|| format!("file_op delete failed for {}", op.path))?;
                    }
                }
                FileOpKind::Rename | FileOpKind::Move => {
                    let Some(to) = &op.to else {
                        bail!("file_op {} for {} is missing 'to'", kind_str(op.op), op.path);
                    };
                    let dest = self.paths.project_path(to);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::rename(&from, &dest).await.with_context(|| {
                        format!(
                            "file_op {} failed for {} -> {}",
                            kind_str(op.op),
                            op.path,
                            to
                        )
                    })?;
                }
            }
        }

        // 4. adds
        for rel in &manifest.adds {
            let source = skill_dir.join("add").join(rel);
            if !source.exists() {
                bail!("skill add source missing: {}", rel);
            }
            let dest = self.paths.project_path(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&source, &dest)
                .await
                .with_context(|| format!("failed to add {}", rel))?;
        }

        // 5. modifies via three-way merge against the base snapshot
        let mut conflicts = Vec::new();
        let mut pending_base_snapshots: Vec<(String, String)> = Vec::new();
        for rel in &manifest.modifies {
            let source = skill_dir.join("modify").join(rel);
            if !source.exists() {
                bail!("skill modify source missing: {}", rel);
            }
            let skill_content = fs::read_to_string(&source).await?;
            let project_file = self.paths.project_path(rel);
            let current = read_optional(&project_file).await?;
            let base = read_optional(&self.paths.base_path(rel)).await?;

            let effective_base = match (&base, &current) {
                (Some(base), _) => Some(base.clone()),
                (None, Some(current)) => {
                    pending_base_snapshots.push((rel.clone(), current.clone()));
                    Some(current.clone())
                }
                (None, None) => None,
            };

            let outcome = three_way_merge(
                effective_base.as_deref(),
                current.as_deref(),
                &skill_content,
            );
            if outcome.conflicted {
                warn!("Merge conflict in {}", rel);
                conflicts.push(rel.clone());
            }
            if let Some(parent) = project_file.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&project_file, outcome.content).await?;
        }
        // Base snapshots are committed only once every modify went through.
        for (rel, content) in pending_base_snapshots {
            let base_path = self.paths.base_path(&rel);
            if let Some(parent) = base_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&base_path, content).await?;
        }

        // 6. package dependencies and env example
        let deps_added = self.merge_package_dependencies(manifest).await?;
        self.append_env_vars(manifest).await?;

        // 7. commands
        if deps_added {
            if let Some(install) = &self.config.install_command {
                self.run_command(install, "dependency install").await?;
            }
        }
        for command in &manifest.post_apply {
            self.run_command(command, "post_apply").await?;
        }
        if let Some(test) = &manifest.test {
            self.run_command(test, "test").await?;
        }

        Ok(conflicts)
    }

    async fn merge_package_dependencies(&self, manifest: &SkillManifest) -> Result<bool> {
        if manifest.dependencies.is_empty() {
            return Ok(false);
        }
        let package_path = self.paths.project_path(&self.config.package_file);
        let mut package: serde_json::Value = match read_optional(&package_path).await? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("malformed {}", self.config.package_file))?,
            None => serde_json::json!({}),
        };
        let object = package
            .as_object_mut()
            .with_context(|| format!("{} is not a JSON object", self.config.package_file))?;
        let deps = object
            .entry("dependencies")
            .or_insert_with(|| serde_json::json!({}));
        let deps = deps
            .as_object_mut()
            .context("package dependencies field is not an object")?;
        let mut added = false;
        for (name, version) in &manifest.dependencies {
            if !deps.contains_key(name) {
                deps.insert(name.clone(), serde_json::Value::String(version.clone()));
                added = true;
            }
        }
        fs::write(&package_path, serde_json::to_string_pretty(&package)?).await?;
        Ok(added)
    }

    async fn append_env_vars(&self, manifest: &SkillManifest) -> Result<()> {
        if manifest.env.is_empty() {
            return Ok(());
        }
        let env_path = self.paths.project_path(&self.config.env_example_file);
        let mut content = read_optional(&env_path).await?.unwrap_or_default();
        for name in &manifest.env {
            let assignment = format!("{}=", name);
            let present = content
                .lines()
                .any(|line| line.trim_start().starts_with(&assignment));
            if !present {
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&assignment);
                content.push('\n');
            }
        }
        fs::write(&env_path, content).await?;
        Ok(())
    }

    async fn run_command(&self, command: &str, label: &str) -> Result<()> {
        info!("Running {} command: {}", label, command);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()
            .await
            .with_context(|| format!("{} command failed to start", label))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} command exited with {}: {}",
                label,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(())
    }

    /// Undo everything a skill touched: restore base snapshots, delete
    /// skill-introduced files (pruning emptied directories), drop its
    /// package dependencies and its ledger entry.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        let mut skill_state = self.paths.load_state().await?;
        let Some(index) = skill_state.applied.iter().position(|s| s.name == name) else {
            bail!("skill {} is not applied", name);
        };
        let record = skill_state.applied[index].clone();

        let mut touched: Vec<String> = record.file_hashes.keys().cloned().collect();
        if !record.added_dependencies.is_empty() {
            touched.push(self.config.package_file.clone());
        }
        self.paths.backup_files(&touched).await?;

        match self.uninstall_steps(&record).await {
            Ok(()) => {
                skill_state.applied.remove(index);
                self.paths.save_state(&skill_state).await?;
                self.paths.clear_backup().await?;
                info!("Skill {} uninstalled", name);
                Ok(())
            }
            Err(e) => {
                warn!("Skill {} uninstall failed, rolling back: {}", name, e);
                if let Err(restore_err) = self.paths.restore_backup().await {
                    warn!(
                        "Rollback of skill {} uninstall hit an error: {}",
                        name, restore_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn uninstall_steps(&self, record: &AppliedSkill) -> Result<()> {
        for rel in record.file_hashes.keys() {
            let base_path = self.paths.base_path(rel);
            let project_file = self.paths.project_path(rel);
            if base_path.exists() {
                if let Some(parent) = project_file.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&base_path, &project_file)
                    .await
                    .with_context(|| format!("failed to restore base of {}", rel))?;
                fs::remove_file(&base_path).await?;
                state::prune_empty_dirs(&self.paths.base_dir(), &base_path).await;
            } else {
                if project_file.exists() {
                    fs::remove_file(&project_file)
                        .await
                        .with_context(|| format!("failed to remove {}", rel))?;
                }
                state::prune_empty_dirs(&self.root, &project_file).await;
            }
        }

        if !record.added_dependencies.is_empty() {
            let package_path = self.paths.project_path(&self.config.package_file);
            if let Some(raw) = read_optional(&package_path).await? {
                let mut package: serde_json::Value = serde_json::from_str(&raw)
                    .with_context(|| format!("malformed {}", self.config.package_file))?;
                if let Some(deps) = package
                    .get_mut("dependencies")
                    .and_then(|d| d.as_object_mut())
                {
                    for dep in record.added_dependencies.keys() {
                        deps.remove(dep);
                    }
                }
                fs::write(&package_path, serde_json::to_string_pretty(&package)?).await?;
            }
        }
        Ok(())
    }
}

async fn read_manifest(skill_dir: &Path) -> Result<SkillManifest> {
    let path = skill_dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read skill manifest {:?}", path))?;
    toml::from_str(&raw).with_context(|| format!("malformed skill manifest {:?}", path))
}

/// Reject traversal and absolute paths in every manifest file reference.
fn validate_paths(manifest: &SkillManifest) -> Result<()> {
    let mut all: Vec<&str> = Vec::new();
    all.extend(manifest.adds.iter().map(String::as_str));
    all.extend(manifest.modifies.iter().map(String::as_str));
    for op in &manifest.file_ops {
        all.push(&op.path);
        if let Some(to) = &op.to {
            all.push(to);
        }
    }
    for rel in all {
        if rel.contains("..") || rel.starts_with('/') || rel.starts_with('\\') || rel.is_empty() {
            bail!("invalid skill file path: {:?}", rel);
        }
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path).await?))
}

async fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).await?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn kind_str(kind: FileOpKind) -> &'static str {
    match kind {
        FileOpKind::Delete => "delete",
        FileOpKind::Rename => "rename",
        FileOpKind::Move => "move",
    }
}
