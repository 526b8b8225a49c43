#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! End-to-end control socket: bind `api.sock`, connect a real
//! `UnixStream`, and round-trip a `StatusRequest`/`StatusResponse` through
//! the framed codec exactly as the `vt` CLI would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use vibetunnel_core::codec::{FrameCodec, MessageType};
use vibetunnel_core::control::protocol::{StatusRequest, StatusResponse};
use vibetunnel_core::control::socket::{ControlSocket, NoGitEventSink};
use vibetunnel_core::errors::GitError;
use vibetunnel_core::git_ops::{GitOps, WorktreeEntry};
use vibetunnel_core::manager::SessionManager;

#[derive(Debug, Default)]
struct NoopGitOps;

#[async_trait]
impl GitOps for NoopGitOps {
    async fn install_hooks(&self, _repo_path: &std::path::Path) -> Result<(), GitError> {
        Ok(())
    }
    async fn uninstall_hooks(&self, _repo_path: &std::path::Path) -> Result<(), GitError> {
        Ok(())
    }
    async fn worktree_list(&self, _repo_path: &std::path::Path) -> Result<Vec<WorktreeEntry>, GitError> {
        Ok(Vec::new())
    }
    async fn current_branch(&self, _repo_path: &std::path::Path) -> Result<Option<String>, GitError> {
        Ok(None)
    }
    async fn set_config(&self, _repo_path: &std::path::Path, _key: &str, _value: &str) -> Result<(), GitError> {
        Ok(())
    }
    async fn unset_config(&self, _repo_path: &std::path::Path, _key: &str) -> Result<(), GitError> {
        Ok(())
    }
    async fn get_config(&self, _repo_path: &std::path::Path, _key: &str) -> Result<Option<String>, GitError> {
        Ok(None)
    }
}

#[tokio::test]
async fn status_request_round_trips_over_the_real_socket() {
    let control = TempDir::new().expect("tempdir");
    let socket_path = control.path().join("api.sock");

    let manager = Arc::new(SessionManager::new(control.path().join("sessions")).await.expect("manager"));
    let socket = Arc::new(ControlSocket::new(manager, Arc::new(NoopGitOps), Arc::new(NoGitEventSink)));

    let serve_path = socket_path.clone();
    let server = tokio::spawn(async move {
        let _ = socket.serve(&serve_path).await;
    });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stream = UnixStream::connect(&socket_path).await.expect("connect to api.sock");
    let mut framed = Framed::new(stream, FrameCodec::new());

    let payload = serde_json::to_vec(&StatusRequest::default()).expect("serialize request");
    framed
        .send(vibetunnel_core::codec::Frame {
            message_type: MessageType::StatusRequest,
            payload: payload.into(),
        })
        .await
        .expect("send status request");

    let response = framed.next().await.expect("response present").expect("decode response");
    assert_eq!(response.message_type, MessageType::StatusResponse);
    let status: StatusResponse = serde_json::from_slice(&response.payload).expect("parse status response");
    assert!(status.running);

    server.abort();
}
