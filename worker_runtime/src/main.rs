//! coreclaw worker runtime shell.
//!
//! Runs inside the sandbox the invoker builds around it. The contract:
//! one JSON input frame arrives on stdin, zero or more sentinel-delimited
//! output frames leave on stdout, and follow-up messages arrive as JSON
//! files in the `input/` mailbox directory (passed as the last argument).
//! A zero-byte `_close` file asks the shell to exit cleanly.
//!
//! The model-calling logic lives in an external adapter; this shell
//! produces a deterministic acknowledge/echo result so the full pipeline
//! can run in sandbox and development setups.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const OUTPUT_START: &str = "---CORECLAW_OUTPUT_START---";
const OUTPUT_END: &str = "---CORECLAW_OUTPUT_END---";

const MAILBOX_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CLOSE_SENTINEL: &str = "_close";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerInput {
    task_id: String,
    task_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    #[allow(dead_code)]
    secrets: HashMap<String, String>,
    #[serde(default)]
    #[allow(dead_code)]
    conductor_context: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentOutput {
    status: String,
    priority: String,
    summary: String,
    needs_review: bool,
    outputs: Vec<OutputItem>,
    metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn emit_frame(output: &AgentOutput) {
    let body = serde_json::to_string(output).unwrap_or_else(|e| {
        format!(
            "{{\"status\":\"failed\",\"priority\":\"normal\",\"summary\":\"serialization error\",\"needsReview\":false,\"outputs\":[],\"metadata\":{{}},\"error\":\"{}\"}}",
            e
        )
    });
    println!("{}", OUTPUT_START);
    println!("{}", body);
    println!("{}", OUTPUT_END);
}

fn build_result(input: &WorkerInput) -> AgentOutput {
    let priority = input.payload["priority"]
        .as_str()
        .unwrap_or("normal")
        .to_string();
    let summary = input.payload["summary"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "Processed {} task {} in runtime shell",
                input.task_type, input.task_id
            )
        });
    let outputs = match input.payload["respondWith"].as_str() {
        Some(content) => vec![OutputItem {
            kind: "reply".to_string(),
            content: content.to_string(),
        }],
        None => Vec::new(),
    };
    AgentOutput {
        status: "completed".to_string(),
        priority,
        summary,
        needs_review: input.payload["needsReview"].as_bool().unwrap_or(false),
        outputs,
        metadata: serde_json::json!({ "runtime": "shell" }),
        error: None,
    }
}

/// Watch the mailbox until `_close` appears, acknowledging each message
/// with a fresh output frame.
fn mailbox_loop(input_dir: &Path) {
    loop {
        if input_dir.join(CLOSE_SENTINEL).exists() {
            eprintln!("runtime shell: close sentinel received");
            return;
        }
        let entries = match std::fs::read_dir(input_dir) {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("runtime shell: mailbox read failed: {}", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            if let Ok(raw) = std::fs::read_to_string(&path) {
                let text = serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()
                    .and_then(|v| v["text"].as_str().map(str::to_string))
                    .unwrap_or_else(|| "<unreadable message>".to_string());
                emit_frame(&AgentOutput {
                    status: "partial".to_string(),
                    priority: "normal".to_string(),
                    summary: format!("Received follow-up: {}", truncate(&text, 120)),
                    needs_review: false,
                    outputs: Vec::new(),
                    metadata: serde_json::json!({ "runtime": "shell" }),
                    error: None,
                });
            }
            let _ = std::fs::remove_file(&path);
        }
        std::thread::sleep(MAILBOX_POLL_INTERVAL);
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn main() {
    let ipc_dir: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);

    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        eprintln!("runtime shell: failed to read stdin: {}", e);
        std::process::exit(1);
    }

    let input: WorkerInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("runtime shell: malformed input frame: {}", e);
            emit_frame(&AgentOutput {
                status: "failed".to_string(),
                priority: "normal".to_string(),
                summary: "malformed input frame".to_string(),
                needs_review: false,
                outputs: Vec::new(),
                metadata: serde_json::json!({ "runtime": "shell" }),
                error: Some(e.to_string()),
            });
            std::process::exit(1);
        }
    };

    emit_frame(&build_result(&input));

    // Interactive tasks stay alive for follow-ups until told to close.
    if input.payload["interactive"].as_bool().unwrap_or(false) {
        if let Some(dir) = ipc_dir {
            mailbox_loop(&dir.join("input"));
        }
    }
}
