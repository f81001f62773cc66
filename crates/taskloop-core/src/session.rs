//! Session persistence for saving and resuming workflows.
//!
//! Each session lives in its own directory under the sessions base dir and
//! is persisted as `state.json`. Saves are atomic: the state is written to a
//! temp file in the session directory, then renamed over the canonical file,
//! so a reader never observes a partially written state.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{id}' is corrupted: {detail}")]
    Corrupted { id: String, detail: String },
    #[error("disk full, cannot save session; free up disk space and try again")]
    DiskFull,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// ENOSPC on unix; the only disk condition we distinguish.
fn is_disk_full(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(28)
}

fn map_io(err: std::io::Error) -> SessionError {
    if is_disk_full(&err) {
        SessionError::DiskFull
    } else {
        SessionError::Io(err)
    }
}

/// Local-time ISO timestamp with microsecond precision.
fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// "user", "assistant", or "system".
    pub role: String,
    pub content: String,
    #[serde(default = "now_iso")]
    pub timestamp: String,
}

impl SessionMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: now_iso(),
        }
    }
}

fn default_phase_id() -> String {
    "PRD".to_string()
}

/// A workflow session that can be persisted and resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Immutable once created.
    pub session_id: String,
    pub task_description: String,
    #[serde(default = "default_phase_id")]
    pub current_phase: String,
    #[serde(default)]
    pub conversation_history: Vec<SessionMessage>,
    /// Outputs stored per skill name; kept in the schema for compatibility.
    #[serde(default)]
    pub skill_outputs: BTreeMap<String, Value>,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default = "now_iso")]
    pub updated_at: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, task_description: impl Into<String>) -> Self {
        let now = now_iso();
        Self {
            session_id: session_id.into(),
            task_description: task_description.into(),
            current_phase: default_phase_id(),
            conversation_history: Vec::new(),
            skill_outputs: BTreeMap::new(),
            created_at: now.clone(),
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Append a message to the conversation history and refresh `updated_at`.
    pub fn add_message(&mut self, role: &str, content: &str) {
        self.conversation_history.push(SessionMessage::new(role, content));
        self.updated_at = now_iso();
    }

    /// Store the output from a skill and refresh `updated_at`.
    pub fn set_skill_output(&mut self, skill_name: &str, output: Value) {
        self.skill_outputs.insert(skill_name.to_string(), output);
        self.updated_at = now_iso();
    }

    /// Refresh `updated_at` after an out-of-band mutation.
    pub fn touch(&mut self) {
        self.updated_at = now_iso();
    }
}

/// Summary information about a session, as shown in listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub task_description: String,
    pub current_phase: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Generate a unique session id: `YYYYMMDD-HHMMSS-XXXX`, where `XXXX` is the
/// first 4 hex chars of a hash over the timestamp and microsecond. Collision
/// avoidance is best-effort only.
pub fn generate_session_id() -> String {
    let now = Local::now();
    let timestamp = now.format("%Y%m%d-%H%M%S").to_string();
    let micros = now.format("%6f").to_string();
    let digest = Sha256::digest(format!("{timestamp}-{micros}").as_bytes());
    let hex: String = digest.iter().take(2).map(|b| format!("{b:02x}")).collect();
    format!("{timestamp}-{hex}")
}

/// Directory holding a single session's files.
pub fn session_dir(base_dir: &Path, session_id: &str) -> PathBuf {
    base_dir.join(session_id)
}

fn state_path(base_dir: &Path, session_id: &str) -> PathBuf {
    session_dir(base_dir, session_id).join("state.json")
}

/// Create a new session and persist it immediately.
pub fn create(task_description: &str, base_dir: &Path) -> Result<Session> {
    let session = Session::new(generate_session_id(), task_description);
    save(&session, base_dir)?;
    Ok(session)
}

/// Save a session to disk using an atomic temp-file-then-rename write.
///
/// The temp file is created in the session's own directory so the final
/// rename stays on one filesystem. The temp file is removed on any write
/// failure; disk-full is reported as its own error kind.
pub fn save(session: &Session, base_dir: &Path) -> Result<()> {
    let dir = session_dir(base_dir, &session.session_id);
    fs::create_dir_all(&dir).map_err(map_io)?;

    let body = serde_json::to_string_pretty(session).map_err(|e| SessionError::Corrupted {
        id: session.session_id.clone(),
        detail: e.to_string(),
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".state-")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(map_io)?;
    tmp.write_all(body.as_bytes()).map_err(map_io)?;
    tmp.flush().map_err(map_io)?;

    // Atomic replace; NamedTempFile removes the temp file on drop if the
    // persist fails.
    tmp.persist(state_path(base_dir, &session.session_id))
        .map_err(|e| map_io(e.error))?;
    Ok(())
}

/// Load a session from disk.
///
/// Errors with `NotFound` if the session directory is absent, `Corrupted` if
/// `state.json` is missing or fails to decode.
pub fn load(session_id: &str, base_dir: &Path) -> Result<Session> {
    let dir = session_dir(base_dir, session_id);
    if !dir.exists() {
        return Err(SessionError::NotFound(session_id.to_string()));
    }

    let path = state_path(base_dir, session_id);
    if !path.exists() {
        return Err(SessionError::Corrupted {
            id: session_id.to_string(),
            detail: "missing state.json".to_string(),
        });
    }

    let body = fs::read_to_string(&path).map_err(map_io)?;
    serde_json::from_str(&body).map_err(|e| SessionError::Corrupted {
        id: session_id.to_string(),
        detail: e.to_string(),
    })
}

/// List all sessions under the base dir, most recently updated first.
///
/// Corrupt entries are skipped so one bad session never breaks the listing.
pub fn list(base_dir: &Path) -> Vec<SessionInfo> {
    let Ok(entries) = fs::read_dir(base_dir) else {
        return Vec::new();
    };

    let mut sessions: Vec<SessionInfo> = Vec::new();

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let path = dir.join("state.json");
        let Ok(body) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(data) = serde_json::from_str::<Value>(&body) else {
            continue;
        };

        let str_field = |key: &str, fallback: &str| -> String {
            data.get(key)
                .and_then(Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };
        let dir_name = entry.file_name().to_string_lossy().into_owned();

        sessions.push(SessionInfo {
            session_id: str_field("session_id", &dir_name),
            task_description: str_field("task_description", "Unknown"),
            current_phase: str_field("current_phase", "Unknown"),
            created_at: str_field("created_at", "Unknown"),
            updated_at: str_field("updated_at", "Unknown"),
        });
    }

    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    sessions
}

/// Delete a session and all its files.
pub fn delete(session_id: &str, base_dir: &Path) -> Result<()> {
    let dir = session_dir(base_dir, session_id);
    if !dir.exists() {
        return Err(SessionError::NotFound(session_id.to_string()));
    }

    for entry in fs::read_dir(&dir)? {
        fs::remove_file(entry?.path())?;
    }
    fs::remove_dir(&dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = generate_session_id();
        // YYYYMMDD-HHMMSS-XXXX
        assert_eq!(id.len(), 20);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn create_persists_immediately() {
        let tmp = TempDir::new().unwrap();
        let session = create("build a widget", tmp.path()).unwrap();
        assert!(state_path(tmp.path(), &session.session_id).exists());
        assert_eq!(session.current_phase, "PRD");
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut session = Session::new("20250101-120000-abcd", "refactor the parser");
        session.add_message("user", "start");
        session.add_message("assistant", "on it");
        session.current_phase = "research".to_string();
        session.set_skill_output("researcher", serde_json::json!({"files": 3}));
        save(&session, tmp.path()).unwrap();

        let loaded = load("20250101-120000-abcd", tmp.path()).unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.task_description, "refactor the parser");
        assert_eq!(loaded.current_phase, "research");
        assert_eq!(loaded.conversation_history.len(), 2);
        assert_eq!(loaded.conversation_history[0].role, "user");
        assert_eq!(loaded.conversation_history[1].content, "on it");
        assert_eq!(loaded.skill_outputs["researcher"]["files"], 3);
    }

    #[test]
    fn load_missing_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = load("nope", tmp.path()).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn load_dir_without_state_is_corrupted() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("20250101-120000-aaaa")).unwrap();
        let err = load("20250101-120000-aaaa", tmp.path()).unwrap_err();
        assert!(matches!(err, SessionError::Corrupted { .. }));
    }

    #[test]
    fn load_invalid_json_is_corrupted() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("bad");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("state.json"), "{ not json").unwrap();
        let err = load("bad", tmp.path()).unwrap_err();
        assert!(matches!(err, SessionError::Corrupted { .. }));
    }

    #[test]
    fn load_tolerates_missing_optional_fields() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sparse");
        fs::create_dir(&dir).unwrap();
        fs::write(
            dir.join("state.json"),
            r#"{"session_id": "sparse", "task_description": "minimal"}"#,
        )
        .unwrap();
        let loaded = load("sparse", tmp.path()).unwrap();
        assert_eq!(loaded.current_phase, "PRD");
        assert!(loaded.conversation_history.is_empty());
        assert!(loaded.metadata.is_empty());
    }

    #[test]
    fn save_leaves_previous_state_intact_on_interrupted_write() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new("crashy", "simulate crash");
        save(&session, tmp.path()).unwrap();

        // A straggling temp file from a crashed writer must not affect the
        // committed state.
        let dir = session_dir(tmp.path(), "crashy");
        fs::write(dir.join(".state-orphan.tmp"), "{\"partial\":").unwrap();

        let loaded = load("crashy", tmp.path()).unwrap();
        assert_eq!(loaded.task_description, "simulate crash");
    }

    #[test]
    fn save_overwrites_atomically() {
        let tmp = TempDir::new().unwrap();
        let mut session = Session::new("s1", "v1");
        save(&session, tmp.path()).unwrap();
        session.task_description = "v2".to_string();
        session.touch();
        save(&session, tmp.path()).unwrap();

        let loaded = load("s1", tmp.path()).unwrap();
        assert_eq!(loaded.task_description, "v2");
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(session_dir(tmp.path(), "s1"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn list_skips_corrupt_sessions() {
        let tmp = TempDir::new().unwrap();
        for (id, task) in [("a", "task one"), ("b", "task two"), ("c", "task three")] {
            let session = Session::new(id, task);
            save(&session, tmp.path()).unwrap();
        }
        let bad = tmp.path().join("broken");
        fs::create_dir(&bad).unwrap();
        fs::write(bad.join("state.json"), "garbage").unwrap();

        let sessions = list(tmp.path());
        assert_eq!(sessions.len(), 3);
        assert!(sessions.iter().all(|s| s.session_id != "broken"));
    }

    #[test]
    fn list_sorts_by_updated_at_descending() {
        let tmp = TempDir::new().unwrap();
        let mut old = Session::new("old", "old task");
        old.updated_at = "2025-01-01T00:00:00.000000".to_string();
        let mut recent = Session::new("recent", "recent task");
        recent.updated_at = "2025-06-01T00:00:00.000000".to_string();
        save(&old, tmp.path()).unwrap();
        save(&recent, tmp.path()).unwrap();

        let sessions = list(tmp.path());
        assert_eq!(sessions[0].session_id, "recent");
        assert_eq!(sessions[1].session_id, "old");
    }

    #[test]
    fn list_on_missing_base_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(list(&tmp.path().join("does-not-exist")).is_empty());
    }

    #[test]
    fn delete_removes_session() {
        let tmp = TempDir::new().unwrap();
        let session = create("short lived", tmp.path()).unwrap();
        delete(&session.session_id, tmp.path()).unwrap();
        assert!(!session_dir(tmp.path(), &session.session_id).exists());
    }

    #[test]
    fn delete_missing_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = delete("nope", tmp.path()).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn add_message_refreshes_updated_at() {
        let mut session = Session::new("s", "t");
        let before = session.updated_at.clone();
        std::thread::sleep(std::time::Duration::from_millis(2));
        session.add_message("user", "hello");
        assert!(session.updated_at >= before);
        assert_eq!(session.conversation_history.len(), 1);
    }
}
