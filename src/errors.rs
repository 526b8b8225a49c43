//! Error taxonomy (§7): kinds, not type names. Each variant carries enough
//! context to identify the session, repo path, or remote involved.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed frames, oversize payloads, unknown message types.
///
/// Closing the offending connection is the caller's responsibility; the
/// peer may reconnect.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared frame length exceeds the configured cap.
    #[error("frame length {length} exceeds cap {cap}")]
    PayloadTooLarge {
        /// Declared length in bytes.
        length: u32,
        /// Configured cap in bytes.
        cap: u32,
    },

    /// The leading type byte does not map to a known message type.
    #[error("unknown message type byte {byte:#04x}")]
    UnknownType {
        /// The unrecognized type byte.
        byte: u8,
    },

    /// The frame's JSON payload failed to parse for its declared type.
    #[error("malformed payload for message type {message_type}: {source}")]
    MalformedPayload {
        /// Name of the message type whose payload failed to parse.
        message_type: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Connection closed before a complete frame arrived.
    #[error("connection closed mid-frame")]
    Truncated,
}

/// Filesystem, socket, or PTY failure.
#[derive(Debug, Error)]
pub enum IoError {
    /// A session's stream file could not be opened or written.
    #[error("stream I/O failed for session {session_id} at {path}: {source}")]
    Stream {
        /// The affected session.
        session_id: String,
        /// The stream file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The PTY master could not be spawned, read, or written.
    #[error("PTY I/O failed for session {session_id}: {source}")]
    Pty {
        /// The affected session.
        session_id: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A UNIX socket accept/read/write failed.
    #[error("socket I/O failed at {path}: {source}")]
    Socket {
        /// The socket path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Wraps an external `GitOps` failure. Never retried.
#[derive(Debug, Error)]
#[error("git operation '{operation}' failed for {repo_path}: {message}")]
pub struct GitError {
    /// The repository the operation targeted.
    pub repo_path: PathBuf,
    /// The `GitOps` method that failed (e.g. `"install_hooks"`).
    pub operation: &'static str,
    /// Human-readable failure detail, including stderr when available.
    pub message: String,
}

/// Config or request payloads failing schema.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A `quickStartCommands` entry had an empty command string.
    #[error("quick start command at index {index} has an empty command")]
    EmptyQuickStartCommand {
        /// Index of the offending entry.
        index: usize,
    },

    /// The on-disk config failed schema validation and was not usable as-is.
    #[error("config at {path} failed validation: {reason}")]
    InvalidConfig {
        /// The config file path.
        path: PathBuf,
        /// Why validation failed.
        reason: String,
    },

    /// A control-socket request payload failed to validate.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Why the request is invalid.
        reason: String,
    },
}

/// Hit a per-operation deadline. Not retried automatically except HQ
/// registration (which uses its own bounded backoff).
#[derive(Debug, Error)]
#[error("{operation} timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    /// The operation that timed out.
    pub operation: &'static str,
    /// The configured timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Invariant breakage: duplicate instance, unable to create control
/// directory, port conflict. These exit the process with a specific code.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Another instance of this binary is already running and could not be
    /// displaced.
    #[error("another instance is already running (pid {pid})")]
    DuplicateInstance {
        /// PID of the conflicting process.
        pid: u32,
    },

    /// The control directory could not be created.
    #[error("failed to create control directory at {path}: {source}")]
    ControlDirUnavailable {
        /// The control directory path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configured HTTP port is already bound by another process.
    #[error("port {port} is already in use")]
    PortInUse {
        /// The conflicting port.
        port: u16,
    },
}

impl FatalError {
    /// Exit code for this fatal condition, per §6 (CLI exit codes).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::PortInUse { .. } => 9,
            Self::DuplicateInstance { .. } | Self::ControlDirUnavailable { .. } => 1,
        }
    }
}

/// Errors surfaced by session-manager operations (create/list/attach/kill).
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session with this id is registered.
    #[error("session {session_id} not found")]
    NotFound {
        /// The session id that was not found.
        session_id: String,
    },

    /// Spawning the child process under a PTY failed.
    #[error("failed to spawn session {session_id}: {source}")]
    SpawnFailed {
        /// The session id.
        session_id: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// `argv` was empty.
    #[error("session command must be non-empty")]
    EmptyCommand,

    /// The working directory was not absolute.
    #[error("working directory must be absolute: {path}")]
    RelativeCwd {
        /// The offending path.
        path: PathBuf,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] IoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_message_contains_id() {
        let err = SessionError::NotFound {
            session_id: "abc-123".to_owned(),
        };
        assert!(err.to_string().contains("abc-123"));
    }

    #[test]
    fn fatal_error_exit_codes_match_spec() {
        assert_eq!(FatalError::PortInUse { port: 4020 }.exit_code(), 9);
        assert_eq!(FatalError::DuplicateInstance { pid: 1 }.exit_code(), 1);
    }

    #[test]
    fn protocol_error_reports_offending_length() {
        let err = ProtocolError::PayloadTooLarge {
            length: 99,
            cap: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains("16"));
    }
}
