//! Control directory layout (§6).
//!
//! ```text
//! <controlDir>/
//!   api.sock              control socket (§4.H)
//!   config.json           durable config (§4.L)
//!   <id>/
//!     stdout              asciinema stream (§4.B)
//!     ipc.sock            per-session control socket
//!     meta.json           session metadata
//!     stdin               optional stdin pipe
//! ```

use std::path::PathBuf;

/// Environment variable overriding the control directory location.
pub const CONTROL_DIR_ENV: &str = "VIBETUNNEL_CONTROL_DIR";

/// Resolve the control directory from an explicit override and home
/// directory, without touching process environment state. Pulled out of
/// [`control_dir`] so the resolution order can be unit tested without
/// mutating `std::env` (this crate forbids `unsafe_code`, and mutating the
/// process environment in tests requires it since edition 2024).
#[must_use]
pub fn resolve_control_dir(env_override: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    env_override.or_else(|| home.map(|home| home.join(".vibetunnel")))
}

/// Base directory holding every session's control state.
///
/// Resolution order: `$VIBETUNNEL_CONTROL_DIR`, else `$HOME/.vibetunnel`.
///
/// # Panics
///
/// Panics if neither the environment variable nor the home directory can be
/// resolved.
#[must_use]
pub fn control_dir() -> PathBuf {
    let env_override = std::env::var(CONTROL_DIR_ENV).ok().map(PathBuf::from);
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    resolve_control_dir(env_override, dirs::home_dir())
        .expect("could not determine control directory: no override set and no home directory")
}

/// Path to the control-plane UNIX socket (§4.H).
#[must_use]
pub fn control_socket_path() -> PathBuf {
    control_dir().join("api.sock")
}

/// Path to the durable JSON config file (§4.L, §6).
#[must_use]
pub fn config_path() -> PathBuf {
    control_dir().join("config.json")
}

/// Directory for a single session's persistent state, under the global
/// control directory.
#[must_use]
pub fn session_dir(session_id: &str) -> PathBuf {
    session_dir_under(&control_dir(), session_id)
}

/// Path to a session's asciinema stream file, under the global control
/// directory.
#[must_use]
pub fn stream_path(session_id: &str) -> PathBuf {
    stream_path_under(&control_dir(), session_id)
}

/// Path to a session's metadata file, under the global control directory.
#[must_use]
pub fn meta_path(session_id: &str) -> PathBuf {
    meta_path_under(&control_dir(), session_id)
}

/// Path to a session's per-session IPC socket, under the global control
/// directory.
#[must_use]
pub fn session_socket_path(session_id: &str) -> PathBuf {
    session_socket_path_under(&control_dir(), session_id)
}

/// Path to a session's optional stdin pipe, under the global control
/// directory.
#[must_use]
pub fn stdin_pipe_path(session_id: &str) -> PathBuf {
    stdin_pipe_path_under(&control_dir(), session_id)
}

/// Directory for a single session's persistent state under an explicit
/// control directory. [`SessionManager`](crate::manager::SessionManager)
/// uses these `_under` variants so it is rooted at the directory it was
/// constructed with rather than the process-global one.
#[must_use]
pub fn session_dir_under(control_dir: &std::path::Path, session_id: &str) -> PathBuf {
    control_dir.join(session_id)
}

/// Path to a session's asciinema stream file under an explicit control
/// directory.
#[must_use]
pub fn stream_path_under(control_dir: &std::path::Path, session_id: &str) -> PathBuf {
    session_dir_under(control_dir, session_id).join("stdout")
}

/// Path to a session's metadata file under an explicit control directory.
#[must_use]
pub fn meta_path_under(control_dir: &std::path::Path, session_id: &str) -> PathBuf {
    session_dir_under(control_dir, session_id).join("meta.json")
}

/// Path to a session's per-session IPC socket under an explicit control
/// directory.
#[must_use]
pub fn session_socket_path_under(control_dir: &std::path::Path, session_id: &str) -> PathBuf {
    session_dir_under(control_dir, session_id).join("ipc.sock")
}

/// Path to a session's optional stdin pipe under an explicit control
/// directory.
#[must_use]
pub fn stdin_pipe_path_under(control_dir: &std::path::Path, session_id: &str) -> PathBuf {
    session_dir_under(control_dir, session_id).join("stdin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_over_home() {
        let resolved = resolve_control_dir(
            Some(PathBuf::from("/tmp/vt-test-control")),
            Some(PathBuf::from("/home/someone")),
        );
        assert_eq!(resolved, Some(PathBuf::from("/tmp/vt-test-control")));
    }

    #[test]
    fn falls_back_to_home_dot_vibetunnel() {
        let resolved = resolve_control_dir(None, Some(PathBuf::from("/home/someone")));
        assert_eq!(resolved, Some(PathBuf::from("/home/someone/.vibetunnel")));
    }

    #[test]
    fn none_when_neither_is_available() {
        assert_eq!(resolve_control_dir(None, None), None);
    }

    #[test]
    fn session_paths_nest_under_control_dir() {
        let base = PathBuf::from("/tmp/vt-test-control2");
        assert_eq!(base.join("abc").join("stdout"), stream_path_under(&base, "abc"));
        assert_eq!(base.join("abc").join("meta.json"), meta_path_under(&base, "abc"));
    }
}
