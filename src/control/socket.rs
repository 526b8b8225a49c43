//! The control-plane UNIX socket server (§4.H).
//!
//! Two kinds of socket share this module's machinery: the daemon-wide
//! `api.sock` (status, Git follow-mode, Git event notifications) and each
//! session's own `ipc.sock` (stdin forwarding, resize). Both are served by
//! the same accept loop and [`crate::codec::FrameCodec`] framing; they
//! differ only in which [`crate::codec::MessageType`]s they dispatch.
//!
//! Per §4.H, a request whose JSON payload fails to parse gets an `ERROR`
//! frame back and the connection stays open; a codec-level
//! [`ProtocolError`] (bad length, unknown type byte) closes the connection
//! instead (§7, §8 scenario S5). Every request is bounded by
//! [`REQUEST_TIMEOUT`]; a request that runs past it is answered with an
//! `ERROR` frame rather than left to hang the connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::codec::{Frame, FrameCodec, MessageType};
use crate::control::protocol::{
    ErrorResponse, GitEventAck, GitEventNotify, GitFollowRequest, GitFollowResponse, ResizeRequest, StatusRequest,
    StatusResponse,
};
use crate::git_ops::{resolve_follow_target, GitOps, FOLLOW_BRANCH_CONFIG_KEY, FOLLOW_WORKTREE_CONFIG_KEY};
use crate::manager::SessionManager;

/// Per-request deadline (§5): a request that has not produced a response by
/// this point is answered with an `ERROR` frame.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards a parsed `GIT_EVENT_NOTIFY` to whatever external event sink the
/// caller wires in (the reference topology's HTTP `/api/git/event`, §4.H).
/// This crate does not implement that sink's body, only the boundary.
#[async_trait]
pub trait GitEventSink: Send + Sync {
    /// Handle one Git event notification. Returns whether it was forwarded
    /// successfully; the caller reports this back as `GIT_EVENT_ACK.handled`.
    async fn handle_event(&self, notify: &GitEventNotify) -> bool;
}

/// Default sink for a daemon with no external event forwarding wired in:
/// every notification is reported unhandled.
#[derive(Debug, Default)]
pub struct NoGitEventSink;

#[async_trait]
impl GitEventSink for NoGitEventSink {
    async fn handle_event(&self, _notify: &GitEventNotify) -> bool {
        false
    }
}

/// Serves the daemon-wide `api.sock`: status, Git follow-mode, Git event
/// notifications.
///
/// Follow-mode requests against the same repository are serialized (§5, §8
/// property 5) via a lock keyed by the repository path; requests against
/// different repositories proceed concurrently.
pub struct ControlSocket {
    manager: Arc<SessionManager>,
    git: Arc<dyn GitOps>,
    event_sink: Arc<dyn GitEventSink>,
    follow_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ControlSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSocket").finish_non_exhaustive()
    }
}

impl ControlSocket {
    /// Create a server over `manager`, using `git` for follow-mode requests
    /// and `event_sink` to forward `GIT_EVENT_NOTIFY` (§4.H).
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, git: Arc<dyn GitOps>, event_sink: Arc<dyn GitEventSink>) -> Self {
        Self {
            manager,
            git,
            event_sink,
            follow_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `path`, removing a stale socket file left behind by a prior
    /// instance, and serve connections until the listener errors out.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the socket cannot be bound.
    pub async fn serve(self: Arc<Self>, path: &Path) -> std::io::Result<()> {
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        let listener = UnixListener::bind(path)?;
        loop {
            let (stream, _addr) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_connection(stream).await;
            });
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let mut framed = Framed::new(stream, FrameCodec::new());
        loop {
            let next = framed.next().await;
            let Some(frame) = next else { break };
            let frame = match frame {
                Ok(frame) => frame,
                Err(protocol_error) => {
                    let _ = framed.send(encode_error(&protocol_error.to_string())).await;
                    break;
                }
            };

            let response = tokio::time::timeout(REQUEST_TIMEOUT, self.dispatch(frame)).await;
            let response = match response {
                Ok(response) => response,
                Err(_elapsed) => encode_error("request timed out"),
            };

            if let Some(response) = response {
                if framed.send(response).await.is_err() {
                    break;
                }
            }
        }
    }

    /// Dispatch one request frame to its handler. Returns `None` for
    /// fire-and-forget message types (`Heartbeat`).
    async fn dispatch(&self, frame: Frame) -> Option<Frame> {
        match frame.message_type {
            MessageType::StatusRequest => match serde_json::from_slice::<StatusRequest>(&frame.payload) {
                Ok(request) => Some(json_frame(MessageType::StatusResponse, &self.status(&request).await)),
                Err(_) => Some(encode_error("malformed StatusRequest")),
            },
            MessageType::GitFollowRequest => Some(match serde_json::from_slice::<GitFollowRequest>(&frame.payload) {
                Ok(request) => json_frame(MessageType::GitFollowResponse, &self.handle_git_follow(request).await),
                Err(_) => encode_error("malformed GitFollowRequest"),
            }),
            MessageType::GitEventNotify => Some(match serde_json::from_slice::<GitEventNotify>(&frame.payload) {
                Ok(notify) => {
                    let handled = self.event_sink.handle_event(&notify).await;
                    json_frame(MessageType::GitEventAck, &GitEventAck { handled })
                }
                Err(_) => encode_error("malformed GitEventNotify"),
            }),
            MessageType::Heartbeat => None,
            _ => Some(encode_error("message type not valid on this socket")),
        }
    }

    /// Gather `{running, port, url, followMode?}` (§4.H). `followMode` is
    /// computed by reading the follow-mode config keys (§4.H, §9) for
    /// `request.repo_path`, or the daemon's current working directory when
    /// the caller did not supply one.
    async fn status(&self, request: &StatusRequest) -> StatusResponse {
        let repo_path = request
            .repo_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok());

        let follow_mode = match repo_path {
            Some(repo_path) => self.resolve_follow_mode(&repo_path).await,
            None => None,
        };

        StatusResponse {
            running: true,
            port: None,
            url: None,
            follow_mode,
        }
    }

    /// The branch currently being followed in `repo_path`, if any (worktree
    /// key authoritative over the legacy branch key, per §9).
    async fn resolve_follow_mode(&self, repo_path: &Path) -> Option<String> {
        if let Ok(Some(worktree)) = self.git.get_config(repo_path, FOLLOW_WORKTREE_CONFIG_KEY).await {
            return self.git.current_branch(Path::new(&worktree)).await.ok().flatten();
        }
        if let Ok(Some(branch)) = self.git.get_config(repo_path, FOLLOW_BRANCH_CONFIG_KEY).await {
            return Some(branch);
        }
        None
    }

    async fn handle_git_follow(&self, request: GitFollowRequest) -> GitFollowResponse {
        let repo_path = PathBuf::from(&request.repo_path);
        let lock = {
            let mut locks = self.follow_locks.lock().await;
            Arc::clone(locks.entry(repo_path.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _guard = lock.lock().await;

        if !request.enable {
            let _ = self.git.uninstall_hooks(&repo_path).await;
            let _ = self.git.unset_config(&repo_path, FOLLOW_WORKTREE_CONFIG_KEY).await;
            let _ = self.git.unset_config(&repo_path, FOLLOW_BRANCH_CONFIG_KEY).await;
            return GitFollowResponse::success(None);
        }

        let target = resolve_follow_target(
            self.git.as_ref(),
            &repo_path,
            request.branch.as_deref(),
            request.worktree_path.as_deref().map(Path::new),
        )
        .await;

        let target = match target {
            Ok(target) => target,
            Err(message) => return GitFollowResponse::failure(message),
        };

        if let Err(err) = self.git.install_hooks(&repo_path).await {
            return GitFollowResponse::failure(err.to_string());
        }
        if target != repo_path {
            if let Err(err) = self.git.install_hooks(&target).await {
                return GitFollowResponse::failure(err.to_string());
            }
        }
        if let Err(err) = self
            .git
            .set_config(&repo_path, FOLLOW_WORKTREE_CONFIG_KEY, &target.display().to_string())
            .await
        {
            return GitFollowResponse::failure(err.to_string());
        }

        let current_branch = self.git.current_branch(&target).await.ok().flatten();
        GitFollowResponse::success(current_branch)
    }
}

/// Serves one session's `ipc.sock`: raw stdin forwarding and resize
/// requests, scoped to `session_id` implicitly (the session id is which
/// socket the caller connected to, not a payload field).
///
/// # Errors
///
/// Returns an IO error if the socket cannot be bound.
pub async fn serve_session_socket(
    manager: Arc<SessionManager>,
    session_id: String,
    path: &Path,
) -> std::io::Result<()> {
    if path.exists() {
        tokio::fs::remove_file(path).await?;
    }
    let listener = UnixListener::bind(path)?;
    loop {
        let (stream, _addr) = listener.accept().await?;
        let manager = Arc::clone(&manager);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            handle_session_connection(manager, session_id, stream).await;
        });
    }
}

async fn handle_session_connection(manager: Arc<SessionManager>, session_id: String, stream: UnixStream) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    while let Some(frame) = framed.next().await {
        let Ok(frame) = frame else { break };
        let response = match frame.message_type {
            MessageType::Stdin => {
                let _ = manager.write_stdin(&session_id, frame.payload.to_vec()).await;
                None
            }
            MessageType::Resize => match serde_json::from_slice::<ResizeRequest>(&frame.payload) {
                Ok(request) => {
                    let _ = manager.resize(&session_id, request.cols, request.rows).await;
                    None
                }
                Err(_) => Some(encode_error("malformed ResizeRequest")),
            },
            MessageType::Heartbeat => None,
            _ => Some(encode_error("message type not valid on a session socket")),
        };

        if let Some(response) = response {
            if framed.send(response).await.is_err() {
                break;
            }
        }
    }
}

fn json_frame<T: serde::Serialize>(message_type: MessageType, value: &T) -> Frame {
    let payload = serde_json::to_vec(value).unwrap_or_default();
    Frame {
        message_type,
        payload: payload.into(),
    }
}

fn encode_error(message: &str) -> Frame {
    json_frame(MessageType::Error, &ErrorResponse::protocol_error(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::GitEventType;
    use crate::errors::GitError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeGitOps {
        install_calls: AtomicUsize,
        followed_worktree: Option<String>,
    }

    #[async_trait]
    impl GitOps for FakeGitOps {
        async fn install_hooks(&self, _repo_path: &Path) -> Result<(), GitError> {
            self.install_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn uninstall_hooks(&self, _repo_path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_list(&self, _repo_path: &Path) -> Result<Vec<crate::git_ops::WorktreeEntry>, GitError> {
            Ok(Vec::new())
        }
        async fn current_branch(&self, _repo_path: &Path) -> Result<Option<String>, GitError> {
            Ok(Some("main".to_owned()))
        }
        async fn set_config(&self, _repo_path: &Path, _key: &str, _value: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn unset_config(&self, _repo_path: &Path, _key: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn get_config(&self, _repo_path: &Path, key: &str) -> Result<Option<String>, GitError> {
            if key == FOLLOW_WORKTREE_CONFIG_KEY {
                Ok(self.followed_worktree.clone())
            } else {
                Ok(None)
            }
        }
    }

    #[derive(Debug, Default)]
    struct RecordingEventSink {
        handled_calls: AtomicUsize,
    }

    #[async_trait]
    impl GitEventSink for RecordingEventSink {
        async fn handle_event(&self, _notify: &GitEventNotify) -> bool {
            self.handled_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn enabling_follow_mode_installs_hooks_and_reports_branch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let git = Arc::new(FakeGitOps::default());
        let socket = ControlSocket::new(manager, git.clone(), Arc::new(NoGitEventSink));

        let response = socket
            .handle_git_follow(GitFollowRequest {
                repo_path: "/repo".to_owned(),
                branch: None,
                enable: true,
                worktree_path: None,
                main_repo_path: None,
            })
            .await;

        assert!(response.success);
        assert_eq!(response.current_branch.as_deref(), Some("main"));
        assert_eq!(git.install_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabling_follow_mode_does_not_install_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let git = Arc::new(FakeGitOps::default());
        let socket = ControlSocket::new(manager, git.clone(), Arc::new(NoGitEventSink));

        let response = socket
            .handle_git_follow(GitFollowRequest {
                repo_path: "/repo".to_owned(),
                branch: None,
                enable: false,
                worktree_path: None,
                main_repo_path: None,
            })
            .await;

        assert!(response.success);
        assert_eq!(git.install_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_computes_follow_mode_from_worktree_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let git = Arc::new(FakeGitOps {
            followed_worktree: Some("/repo-dev".to_owned()),
            ..FakeGitOps::default()
        });
        let socket = ControlSocket::new(manager, git, Arc::new(NoGitEventSink));

        let response = socket
            .status(&StatusRequest {
                repo_path: Some("/repo".to_owned()),
            })
            .await;

        assert_eq!(response.follow_mode.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn status_reports_no_follow_mode_when_config_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let git = Arc::new(FakeGitOps::default());
        let socket = ControlSocket::new(manager, git, Arc::new(NoGitEventSink));

        let response = socket
            .status(&StatusRequest {
                repo_path: Some("/repo".to_owned()),
            })
            .await;

        assert_eq!(response.follow_mode, None);
    }

    #[tokio::test]
    async fn git_event_notify_reports_the_sinks_real_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let git = Arc::new(FakeGitOps::default());
        let sink = Arc::new(RecordingEventSink::default());
        let socket = ControlSocket::new(manager, git, Arc::clone(&sink) as Arc<dyn GitEventSink>);

        let frame = Frame {
            message_type: MessageType::GitEventNotify,
            payload: serde_json::to_vec(&GitEventNotify {
                repo_path: "/repo".to_owned(),
                event_type: GitEventType::Checkout,
            })
            .unwrap()
            .into(),
        };

        let response = socket.dispatch(frame).await.expect("ack frame");
        assert_eq!(response.message_type, MessageType::GitEventAck);
        let ack: GitEventAck = serde_json::from_slice(&response.payload).unwrap();
        assert!(ack.handled);
        assert_eq!(sink.handled_calls.load(Ordering::SeqCst), 1);
    }
}
