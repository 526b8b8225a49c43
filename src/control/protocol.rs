//! JSON payload schemas for each control-socket message type (§3, §4.H).

use serde::{Deserialize, Serialize};

/// `STATUS_REQUEST` payload (§4.H).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    /// Directory to compute `followMode` against. Defaults to the daemon's
    /// current working directory when absent.
    pub repo_path: Option<String>,
}

/// `STATUS_RESPONSE` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// True if the daemon is accepting new sessions.
    pub running: bool,
    /// HTTP port in use by the (external) transport layer, if any.
    pub port: Option<u16>,
    /// Reachable URL for this instance, if any.
    pub url: Option<String>,
    /// Follow-mode branch for the caller's repository, if it is one.
    pub follow_mode: Option<String>,
}

/// `GIT_FOLLOW_REQUEST` payload (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFollowRequest {
    /// Absolute path to the repository.
    pub repo_path: String,
    /// Branch to follow, if resolving by branch name.
    pub branch: Option<String>,
    /// Enable (`true`) or disable (`false`) follow mode.
    pub enable: bool,
    /// Explicit worktree path, taking precedence over `branch` resolution.
    pub worktree_path: Option<String>,
    /// The main repository's path, when `repo_path` is itself a worktree.
    pub main_repo_path: Option<String>,
}

/// `GIT_FOLLOW_RESPONSE` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFollowResponse {
    /// Whether the request succeeded.
    pub success: bool,
    /// The branch now being followed, on success.
    pub current_branch: Option<String>,
    /// Failure detail, on failure.
    pub error: Option<String>,
}

impl GitFollowResponse {
    /// Build a success response.
    #[must_use]
    pub const fn success(current_branch: Option<String>) -> Self {
        Self {
            success: true,
            current_branch,
            error: None,
        }
    }

    /// Build a failure response.
    #[must_use]
    pub const fn failure(error: String) -> Self {
        Self {
            success: false,
            current_branch: None,
            error: Some(error),
        }
    }
}

/// Git event kinds a `GIT_EVENT_NOTIFY` may carry (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitEventType {
    /// Branch/worktree checkout.
    Checkout,
    /// Pull.
    Pull,
    /// Merge.
    Merge,
    /// Rebase.
    Rebase,
    /// Commit.
    Commit,
    /// Push.
    Push,
}

/// `GIT_EVENT_NOTIFY` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitEventNotify {
    /// Absolute repository path the event occurred in.
    pub repo_path: String,
    /// The kind of event.
    #[serde(rename = "type")]
    pub event_type: GitEventType,
}

/// `GIT_EVENT_ACK` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GitEventAck {
    /// Whether the event was forwarded to the sink successfully.
    pub handled: bool,
}

/// `RESIZE` payload, sent on a session's own socket (the session id is
/// implicit in which socket the caller connected to).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// New column count.
    pub cols: u32,
    /// New row count.
    pub rows: u32,
}

/// `STATUS_UPDATE` payload: an unsolicited push, e.g. a Claude
/// working-status change for a followed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// The session this update concerns.
    pub session_id: String,
    /// Free-form status text (e.g. the detector's parsed Claude action).
    pub status: String,
}

/// `ERROR` payload, sent for malformed/unknown requests (§4.H) without
/// closing the connection, distinct from the codec-level
/// [`crate::errors::ProtocolError`] which does close it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// A short machine-readable code, e.g. `"PROTOCOL_ERROR"` (§8 S5).
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    /// Build an error response with the `PROTOCOL_ERROR` code (§8 S5).
    #[must_use]
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self {
            code: "PROTOCOL_ERROR".to_owned(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_follow_request_round_trips_camel_case_fields() {
        let json = r#"{"repoPath":"/r","branch":"dev","enable":true,"worktreePath":null,"mainRepoPath":null}"#;
        let parsed: GitFollowRequest = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.repo_path, "/r");
        assert_eq!(parsed.branch.as_deref(), Some("dev"));
        assert!(parsed.enable);
    }

    #[test]
    fn git_event_notify_tags_type_field_as_type() {
        let notify = GitEventNotify {
            repo_path: "/r".to_owned(),
            event_type: GitEventType::Push,
        };
        let json = serde_json::to_value(&notify).unwrap();
        assert_eq!(json["type"], "push");
    }
}
