//! Worker invoker: runs one task inside an isolated child process, feeds it
//! a single stdin frame, streams sentinel-framed output, and enforces the
//! inactivity timeout with a graceful-then-forced stop.

pub mod frames;
pub mod mailbox;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::core::store::{AgentOutput, SecretMap, SessionStatus, StateStore, TaskRecord};

use frames::FrameParser;

const STDERR_CAPTURE_CAP: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root under which per-task `ipc/<container-id>/` directories live.
    pub ipc_root: PathBuf,
    /// Worker argv. The ipc directory path is appended as the last argument.
    pub command: Vec<String>,
    pub name_prefix: String,
    /// Inactivity timeout: reset whenever a valid frame arrives.
    pub timeout_ms: u64,
    /// Grace period between the clean-stop signal and the forced kill.
    pub grace_ms: u64,
    pub memory_limit_mb: Option<u64>,
    pub allow_network: bool,
    /// Wrap the child with an OS-level sandbox when one is available.
    pub use_sandbox: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ipc_root: PathBuf::from("ipc"),
            command: vec!["coreclaw-worker".to_string()],
            name_prefix: "coreclaw".to_string(),
            timeout_ms: 5 * 60 * 1000,
            grace_ms: 10_000,
            memory_limit_mb: None,
            allow_network: false,
            use_sandbox: true,
        }
    }
}

/// The single JSON document written to the child's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerInput<'a> {
    task_id: &'a str,
    task_type: &'a str,
    payload: &'a serde_json::Value,
    secrets: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conductor_context: Option<&'a serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub container_id: String,
    pub output: AgentOutput,
    pub exit_code: i32,
    pub duration_ms: u64,
}

pub struct WorkerInvoker {
    store: Arc<StateStore>,
    config: WorkerConfig,
}

impl WorkerInvoker {
    pub fn new(store: Arc<StateStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Remove leftover ipc directories from a previous run. Sandboxed
    /// children die with the host (`--die-with-parent`), so stale
    /// directories are the only orphans to reap.
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.config.ipc_root.exists() {
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(&self.config.ipc_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&self.config.name_prefix) && entry.path().is_dir() {
                if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                    warn!("Failed to remove orphan worker dir {}: {}", name, e);
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned worker directories", removed);
        }
        Ok(removed)
    }

    fn container_id(&self) -> String {
        format!("{}-{:08x}", self.config.name_prefix, rand::random::<u32>())
    }

    fn input_dir(&self, container_id: &str) -> PathBuf {
        self.config.ipc_root.join(container_id).join("input")
    }

    /// Drop a follow-up message into a still-running worker's mailbox.
    pub async fn send_followup(&self, container_id: &str, text: &str) -> Result<()> {
        mailbox::drop_message(&self.input_dir(container_id), text).await
    }

    /// Ask a running worker to terminate cleanly.
    pub async fn signal_close(&self, container_id: &str) -> Result<()> {
        mailbox::signal_close(&self.input_dir(container_id)).await
    }

    fn has_bwrap() -> bool {
        std::process::Command::new("which")
            .arg("bwrap")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn build_command(&self, ipc_dir: &std::path::Path) -> Command {
        let ipc_str = ipc_dir.to_string_lossy().to_string();

        let mut argv: Vec<String> = self.config.command.clone();
        argv.push(ipc_str.clone());

        // Memory cap via ulimit in a thin shell wrapper; works inside and
        // outside the sandbox.
        if let Some(limit_mb) = self.config.memory_limit_mb {
            let mut wrapped = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("ulimit -v {}; exec \"$@\"", limit_mb * 1024),
                "sh".to_string(),
            ];
            wrapped.extend(argv);
            argv = wrapped;
        }

        if self.config.use_sandbox && cfg!(target_os = "linux") && Self::has_bwrap() {
            let mut cmd = Command::new("bwrap");
            cmd.args([
                "--ro-bind", "/usr", "/usr",
                "--ro-bind", "/bin", "/bin",
                "--ro-bind-try", "/etc", "/etc",
                "--ro-bind-try", "/lib", "/lib",
                "--ro-bind-try", "/lib64", "/lib64",
                "--bind", &ipc_str, &ipc_str,
                "--proc", "/proc",
                "--dev", "/dev",
                "--tmpfs", "/tmp",
                "--unshare-all",
                "--die-with-parent",
            ]);
            if self.config.allow_network {
                cmd.arg("--share-net");
            }
            cmd.arg("--");
            cmd.args(&argv);
            cmd
        } else {
            if self.config.use_sandbox {
                warn!(
                    "No OS-level sandbox available; running worker with a cleared environment only"
                );
            }
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
    }

    /// Run `task` in a fresh worker. Always resolves to an
    /// [`InvocationResult`] with a non-empty summary; spawn failures and
    /// timeouts are folded into a failed Agent-Output rather than errors.
    pub async fn invoke(
        &self,
        task: &TaskRecord,
        mut secrets: SecretMap,
        conductor_context: Option<serde_json::Value>,
    ) -> Result<InvocationResult> {
        let started = Instant::now();
        let container_id = self.container_id();
        if self.config.command.is_empty() {
            secrets.clear();
            return Ok(InvocationResult {
                container_id,
                output: AgentOutput::failed(
                    "worker spawn failed: no worker command configured",
                    "empty worker command",
                ),
                exit_code: 1,
                duration_ms: 0,
            });
        }
        let ipc_dir = self.config.ipc_root.join(&container_id);
        let input_dir = ipc_dir.join("input");
        let output_dir = ipc_dir.join("output");
        tokio::fs::create_dir_all(&input_dir)
            .await
            .context("failed to create worker input dir")?;
        tokio::fs::create_dir_all(&output_dir)
            .await
            .context("failed to create worker output dir")?;

        let agent_id = task.agent_id.as_deref().unwrap_or(&task.task_type);
        let session = self
            .store
            .insert_session(agent_id, &task.id, Some(&container_id))
            .await?;

        let mut cmd = self.build_command(&ipc_dir);
        cmd.env_clear();
        cmd.env("PATH", "/usr/bin:/bin");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Worker spawn failed for task {}: {}", task.id, e);
                self.store
                    .update_session_status(&session.id, SessionStatus::Error)
                    .await?;
                let _ = tokio::fs::remove_dir_all(&ipc_dir).await;
                secrets.clear();
                return Ok(InvocationResult {
                    container_id,
                    output: AgentOutput::failed(
                        format!("worker spawn failed: {}", truncate(&e.to_string(), 160)),
                        e.to_string(),
                    ),
                    exit_code: 1,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        self.store
            .update_session_status(&session.id, SessionStatus::Running)
            .await?;
        info!("Worker {} started for task {}", container_id, task.id);

        // Single stdin frame; secrets leave host memory right after the
        // write, before we wait on the child at all.
        {
            let input = WorkerInput {
                task_id: &task.id,
                task_type: &task.task_type,
                payload: &task.payload,
                secrets: &secrets,
                conductor_context: conductor_context.as_ref(),
            };
            let mut frame = serde_json::to_vec(&input)?;
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(&frame).await {
                    warn!("Failed to write worker input frame: {}", e);
                }
                drop(stdin);
            }
            frame.iter_mut().for_each(|b| *b = 0);
        }
        secrets.clear();

        // Drain stderr concurrently so the child never blocks on it.
        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut collected = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if collected.len() < STDERR_CAPTURE_CAP {
                                let take = n.min(STDERR_CAPTURE_CAP - collected.len());
                                collected.extend_from_slice(&chunk[..take]);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&collected).to_string()
            })
        });

        // Stream stdout, resetting the inactivity deadline on every valid
        // frame. Frame-size capping lives in the parser.
        let mut parser = FrameParser::new();
        let mut timed_out = false;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let timeout = Duration::from_millis(self.config.timeout_ms);
            let mut deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, lines.next_line()).await {
                    Ok(Ok(Some(line))) => {
                        if parser.feed_line(&line).is_some() {
                            deadline = Instant::now() + timeout;
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!("Worker stdout read error: {}", e);
                        break;
                    }
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        let exit_code = if timed_out {
            warn!(
                "Worker {} timed out after {} ms; requesting clean stop",
                container_id, self.config.timeout_ms
            );
            if let Err(e) = mailbox::signal_close(&input_dir).await {
                warn!("Failed to signal close to worker {}: {}", container_id, e);
            }
            let grace = Duration::from_millis(self.config.grace_ms);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                _ => {
                    warn!("Worker {} ignored close signal; killing", container_id);
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    -1
                }
            }
        } else {
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to reap worker {}: {}", container_id, e);
                    -1
                }
            }
        };

        let stderr_text = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&ipc_dir).await {
            warn!("Failed to remove worker ipc dir {:?}: {}", ipc_dir, e);
        }

        let had_frame = parser.valid_frames() > 0;
        let output = match parser.into_last_valid() {
            Some(output) => output,
            None if timed_out => AgentOutput::failed(
                format!("worker timed out after {} ms", self.config.timeout_ms),
                "timeout waiting for output frame",
            ),
            None => {
                let snippet = truncate(stderr_text.trim(), 200);
                if snippet.is_empty() {
                    AgentOutput::failed(
                        "worker produced no output",
                        format!("exit code {}", exit_code),
                    )
                } else {
                    AgentOutput::failed(snippet, format!("exit code {}", exit_code))
                }
            }
        };

        // A nonzero exit with a valid frame still counts as a stop; the
        // caller decides what to make of the exit code.
        let session_status = if had_frame {
            SessionStatus::Stopped
        } else {
            SessionStatus::Error
        };
        self.store
            .update_session_status(&session.id, session_status)
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Worker {} finished for task {} (exit {}, {} ms)",
            container_id, task.id, exit_code, duration_ms
        );

        Ok(InvocationResult {
            container_id,
            output,
            exit_code,
            duration_ms,
        })
    }
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
