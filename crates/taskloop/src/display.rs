//! Progress display and interaction logging.
//!
//! User-facing output goes to stdout and honors `--quiet` (errors always
//! print). Interactions are appended as newline-delimited JSON to
//! `interactions.jsonl` in the session directory; logging is best-effort
//! and never fails the run.

use chrono::Local;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

const ACTION_PREVIEW_CHARS: usize = 100;

/// Handles progress display and interaction logging.
#[derive(Debug, Clone)]
pub struct Display {
    quiet: bool,
    log_dir: Option<PathBuf>,
}

impl Display {
    pub fn new(quiet: bool, log_dir: Option<PathBuf>) -> Self {
        Self { quiet, log_dir }
    }

    /// Point the interaction log at a session directory.
    pub fn set_log_dir(&mut self, log_dir: PathBuf) {
        self.log_dir = Some(log_dir);
    }

    /// Announce the current phase.
    pub fn show_phase(&self, phase: &str, description: &str) {
        if self.quiet {
            return;
        }
        let rule = "=".repeat(50);
        println!("\n{rule}");
        println!("Phase: {phase}");
        if !description.is_empty() {
            println!("  {description}");
        }
        println!("{rule}\n");
    }

    /// Announce the current iteration.
    pub fn show_iteration(&self, iteration: u32, max_iterations: u32) {
        if self.quiet {
            return;
        }
        println!("\n--- Iteration {iteration}/{max_iterations} ---");
    }

    /// Show a truncated preview of the model's latest output.
    pub fn show_action(&self, action: &str) {
        if self.quiet {
            return;
        }
        let preview: String = if action.chars().count() > ACTION_PREVIEW_CHARS {
            let head: String = action.chars().take(ACTION_PREVIEW_CHARS - 3).collect();
            format!("{head}...")
        } else {
            action.to_string()
        };
        println!("  → {preview}");
    }

    /// Show a status line; errors print even in quiet mode.
    pub fn show_status(&self, status: &str, is_error: bool) {
        let prefix = if is_error { "✗" } else { "✓" };
        if !self.quiet || is_error {
            println!("{prefix} {status}");
        }
    }

    /// One-line summary of the current state.
    pub fn show_summary(&self, phase: &str, iteration: u32, status: &str) {
        println!("\n[{phase}] Iteration {iteration}: {status}");
    }

    /// Append one interaction to `interactions.jsonl`.
    ///
    /// Write failures are swallowed; the run never fails on logging.
    pub fn log_interaction(&self, role: &str, content: &str, metadata: Option<Value>) {
        let Some(log_dir) = &self.log_dir else {
            return;
        };

        let mut entry = json!({
            "timestamp": Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            "role": role,
            "content": content,
        });
        if let Some(metadata) = metadata {
            entry["metadata"] = metadata;
        }

        if let Err(e) = append_line(log_dir, &entry) {
            debug!(error = %e, "interaction log write failed");
        }
    }

    /// Record the start of a session run.
    pub fn start_session_log(&self, session_id: &str) {
        self.log_interaction(
            "system",
            &format!("Session started: {session_id}"),
            Some(json!({"event": "session_start", "session_id": session_id})),
        );
    }

    /// Record the end of a session run.
    pub fn end_session_log(&self, session_id: &str, reason: &str) {
        self.log_interaction(
            "system",
            &format!("Session ended: {session_id}"),
            Some(json!({
                "event": "session_end",
                "session_id": session_id,
                "reason": reason,
            })),
        );
    }
}

fn append_line(log_dir: &std::path::Path, entry: &Value) -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("interactions.jsonl"))?;
    writeln!(file, "{entry}")?;
    Ok(())
}
