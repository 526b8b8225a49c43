//! Session data model (§3).
//!
//! Mirrors the on-disk `meta.json` schema (§6) directly: every field here is
//! either persisted verbatim or derived cheaply from persisted state. Mutator
//! methods each bump `updated_at` so callers never forget to.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a session's title is managed in the PTY output stream (§4.C, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TitleMode {
    /// Pass output through unchanged.
    None,
    /// Strip any OSC 0/1/2 the child emits; inject nothing.
    Filter,
    /// Inject a static `{path, command}` title once per prompt.
    Static,
    /// Inject a `{path, command, activity}` title, refreshed on activity.
    Dynamic,
}

impl TitleMode {
    /// Resolve from `VIBETUNNEL_TITLE_MODE` (§6), falling back to `None` for
    /// an unset or unrecognized value.
    #[must_use]
    pub fn from_env_str(value: &str) -> Self {
        match value {
            "filter" => Self::Filter,
            "static" => Self::Static,
            "dynamic" => Self::Dynamic,
            _ => Self::None,
        }
    }
}

/// A session's runtime lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Directory and metadata exist; PTY spawn has not yet succeeded.
    Starting,
    /// Child process is alive under its PTY.
    Running,
    /// Child has reaped; `exit_code` is set.
    Exited,
}

/// Git metadata attached to a session, when its cwd is inside a repository
/// under follow mode (§4.H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitMeta {
    /// Absolute path to the repository (or worktree) the session started in.
    pub git_repo_path: PathBuf,
    /// Branch checked out at session start, if known.
    pub git_branch: Option<String>,
    /// True when `git_repo_path` is a linked worktree rather than the main
    /// working tree.
    pub git_is_worktree: bool,
    /// The main repository's path, when `git_is_worktree` is true.
    pub git_main_repo_path: Option<PathBuf>,
}

/// Inputs to [`Session::new`] (§4.C creation parameters).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Command and arguments; must be non-empty.
    pub argv: Vec<String>,
    /// Absolute working directory.
    pub cwd: PathBuf,
    /// Environment variables layered on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Human-readable name.
    pub name: String,
    /// Initial terminal width.
    pub cols: u32,
    /// Initial terminal height.
    pub rows: u32,
    /// Title injection mode.
    pub title_mode: TitleMode,
    /// Git metadata, when the cwd is a followed repository.
    pub git: Option<GitMeta>,
}

/// A PTY session's persisted and runtime state (§3).
///
/// Serializes directly to `meta.json` (§6); runtime-only fields (`pid`,
/// `master_fd`) are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque session id: a UUID, or `fwd_<epoch-ms>` for a foreground
    /// forwarding session.
    pub id: String,
    /// Command and arguments.
    pub argv: Vec<String>,
    /// Absolute working directory.
    pub cwd: PathBuf,
    /// Human-readable name.
    pub name: String,
    /// Current terminal width; always equal to the last applied resize.
    pub cols: u32,
    /// Current terminal height; always equal to the last applied resize.
    pub rows: u32,
    /// Title injection mode.
    pub title_mode: TitleMode,
    /// Git metadata, if any.
    #[serde(flatten)]
    pub git: Option<GitMeta>,
    /// ISO-8601 creation timestamp.
    pub started_at_iso: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Exit code, set once `status` is `Exited`.
    pub exit_code: Option<i32>,

    /// Child process id, once spawned. Not serialized.
    #[serde(skip)]
    pub pid: Option<u32>,
}

impl Session {
    /// Build a freshly created session in the `Starting` state.
    #[must_use]
    pub fn new(id: String, config: SessionConfig) -> Self {
        Self {
            id,
            argv: config.argv,
            cwd: config.cwd,
            name: config.name,
            cols: config.cols,
            rows: config.rows,
            title_mode: config.title_mode,
            git: config.git,
            started_at_iso: Utc::now(),
            status: SessionStatus::Starting,
            exit_code: None,
            pid: None,
        }
    }

    /// Record that the PTY spawn succeeded.
    pub fn mark_running(&mut self, pid: u32) {
        self.status = SessionStatus::Running;
        self.pid = Some(pid);
    }

    /// Record that the child process reaped.
    pub fn mark_exited(&mut self, exit_code: i32) {
        self.status = SessionStatus::Exited;
        self.exit_code = Some(exit_code);
    }

    /// Apply a resize, updating the meta fields that must track the last
    /// applied size (§3 invariant).
    pub fn apply_resize(&mut self, cols: u32, rows: u32) {
        self.cols = cols;
        self.rows = rows;
    }

    /// True while the child is expected to be alive.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.status, SessionStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            argv: vec!["sh".to_owned()],
            cwd: PathBuf::from("/tmp"),
            env: Vec::new(),
            name: "test".to_owned(),
            cols: 80,
            rows: 24,
            title_mode: TitleMode::None,
            git: None,
        }
    }

    #[test]
    fn new_session_starts_in_starting_state() {
        let session = Session::new("abc".to_owned(), config());
        assert_eq!(session.status, SessionStatus::Starting);
        assert!(!session.is_running());
    }

    #[test]
    fn mark_running_then_exited() {
        let mut session = Session::new("abc".to_owned(), config());
        session.mark_running(1234);
        assert!(session.is_running());
        session.mark_exited(255);
        assert_eq!(session.status, SessionStatus::Exited);
        assert_eq!(session.exit_code, Some(255));
        assert!(!session.is_running());
    }

    #[test]
    fn resize_updates_cols_rows() {
        let mut session = Session::new("abc".to_owned(), config());
        session.apply_resize(120, 40);
        assert_eq!(session.cols, 120);
        assert_eq!(session.rows, 40);
    }

    #[test]
    fn title_mode_parses_env_values_with_none_fallback() {
        assert_eq!(TitleMode::from_env_str("dynamic"), TitleMode::Dynamic);
        assert_eq!(TitleMode::from_env_str("bogus"), TitleMode::None);
    }
}
