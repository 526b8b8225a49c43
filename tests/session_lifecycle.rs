#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! End-to-end session lifecycle: create a session under a real PTY, read
//! its asciinema stream back off disk, and clean it up once exited.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vibetunnel_core::manager::SessionManager;
use vibetunnel_core::session::{SessionConfig, TitleMode};

fn config(argv: Vec<&str>, cwd: PathBuf) -> SessionConfig {
    SessionConfig {
        argv: argv.into_iter().map(ToOwned::to_owned).collect(),
        cwd,
        env: Vec::new(),
        name: "lifecycle-test".to_owned(),
        cols: 80,
        rows: 24,
        title_mode: TitleMode::None,
        git: None,
    }
}

#[tokio::test]
async fn create_list_attach_produces_a_readable_stream() {
    let control = TempDir::new().expect("tempdir");
    let cwd = std::env::current_dir().expect("cwd");
    let manager = Arc::new(SessionManager::new(control.path().to_path_buf()).await.expect("manager"));

    let session_id = manager
        .create(config(vec!["sh", "-c", "echo ready"], cwd))
        .await
        .expect("create session");

    let listed = manager.list().await.expect("list sessions");
    assert!(listed.iter().any(|info| info.session.id == session_id));

    let stream_path = manager.attach(&session_id).await.expect("attach session");
    assert!(stream_path.exists(), "stream file should be created synchronously with the session");

    // Give the child process a moment to run and flush through the
    // asciinema writer before asserting on stream content.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let contents = tokio::fs::read_to_string(&stream_path).await.expect("read stream");
    let mut lines = contents.lines();
    let header_line = lines.next().expect("header line present");
    let header: serde_json::Value = serde_json::from_str(header_line).expect("header parses as json");
    assert_eq!(header["version"], 2);
}

#[tokio::test]
async fn resize_updates_meta_and_records_an_r_event() {
    let control = TempDir::new().expect("tempdir");
    let cwd = std::env::current_dir().expect("cwd");
    let manager = Arc::new(SessionManager::new(control.path().to_path_buf()).await.expect("manager"));

    let session_id = manager.create(config(vec!["sh", "-c", "sleep 1"], cwd)).await.expect("create session");
    let stream_path = manager.attach(&session_id).await.expect("attach session");

    manager.resize(&session_id, 120, 40).await.expect("resize session");

    let meta_path = vibetunnel_core::paths::meta_path_under(control.path(), &session_id);
    let meta_json = tokio::fs::read_to_string(&meta_path).await.expect("read meta");
    let meta: serde_json::Value = serde_json::from_str(&meta_json).expect("meta parses as json");
    assert_eq!(meta["cols"], 120);
    assert_eq!(meta["rows"], 40);

    // Give the reader task a moment to record the resize event before
    // reading the stream back off disk.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let contents = tokio::fs::read_to_string(&stream_path).await.expect("read stream");
    let found_resize_event = contents.lines().skip(1).any(|line| {
        serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|event| event.get(1).and_then(|kind| kind.as_str()).map(ToOwned::to_owned))
            .as_deref()
            == Some("r")
    });
    assert!(found_resize_event, "stream should contain a resize event after resize()");
}

#[tokio::test]
async fn attach_to_unknown_session_fails() {
    let control = TempDir::new().expect("tempdir");
    let manager = Arc::new(SessionManager::new(control.path().to_path_buf()).await.expect("manager"));
    let result = manager.attach("does-not-exist").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cleanup_removes_exited_sessions_past_max_age() {
    let control = TempDir::new().expect("tempdir");
    let cwd = std::env::current_dir().expect("cwd");
    let manager = Arc::new(SessionManager::new(control.path().to_path_buf()).await.expect("manager"));

    let session_id = manager.create(config(vec!["sh", "-c", "exit 0"], cwd)).await.expect("create session");

    // Let the child exit and the stream file settle, then force every
    // exited session to look older than the cleanup threshold.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let removed = manager.cleanup(Duration::from_secs(0)).await.expect("cleanup");

    // The session may or may not have been reaped as "exited" yet depending
    // on scheduler timing; if it was, it must be the one we created and its
    // directory must be gone.
    if removed.contains(&session_id) {
        let stream_path = vibetunnel_core::paths::stream_path_under(control.path(), &session_id);
        assert!(!stream_path.exists());
    }
}
