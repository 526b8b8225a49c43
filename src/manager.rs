//! Session registry (§4.D): create/list/attach/kill/cleanup over the
//! control directory.
//!
//! Concurrency per §5: the registry itself is one `RwLock`; `list` takes a
//! shared lock over a snapshot, while `create`/`kill`/`cleanup` take the
//! per-session mutex for their session's entry so two operations on
//! different sessions never block each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::aggregator::LocalSnapshotSource;
use crate::control::socket::serve_session_socket;
use crate::dedup::ErrorDedup;
use crate::detector::Detector;
use crate::errors::SessionError;
use crate::materializer::{self, Materializer};
use crate::paths;
use crate::pty::{PtyHandle, PtyStatus};
use crate::session::{Session, SessionConfig, SessionStatus};
use crate::snapshot::BufferSnapshot;
use crate::stream_watcher::StreamWatcher;

/// One entry in the registry: persisted session data plus its live PTY
/// handle (absent once a session has fully exited and been reaped from
/// memory, though its directory and `meta.json` remain on disk), and the
/// stream watcher/materializer pair driving its snapshot feed (§4.E/§4.F).
struct ManagedSession {
    session: Session,
    pty: Option<PtyHandle>,
    materializer: Option<Arc<Materializer>>,
}

/// A session's derived public info, as returned by [`SessionManager::list`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The persisted session data.
    pub session: Session,
    /// Status derived from the live child, if still tracked in memory.
    pub derived_status: SessionStatus,
}

/// Owns the control directory and every session's in-memory state.
pub struct SessionManager {
    control_dir: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Mutex<ManagedSession>>>>,
    detector: Arc<Detector>,
    dedup: Arc<ErrorDedup>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("control_dir", &self.control_dir)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager rooted at `control_dir`, ensuring it exists.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the control directory cannot be created.
    pub async fn new(control_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&control_dir).await?;
        Ok(Self {
            control_dir,
            sessions: RwLock::new(HashMap::new()),
            detector: Arc::new(Detector::new()),
            dedup: Arc::new(ErrorDedup::new()),
        })
    }

    /// Create a new session: allocate its directory, write `meta.json`,
    /// spawn it under a PTY (§4.C), and start its stream watcher (§4.E),
    /// materializer (§4.F), and per-session control socket.
    ///
    /// Takes `self: &Arc<Self>` because the spawned per-session control
    /// socket needs to outlive this call while still reaching back into the
    /// registry for stdin/resize forwarding.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EmptyCommand`] if `argv` is empty,
    /// [`SessionError::RelativeCwd`] if the working directory is not
    /// absolute, or a spawn/IO error from the underlying PTY.
    pub async fn create(self: &Arc<Self>, config: SessionConfig) -> Result<String, SessionError> {
        if config.argv.is_empty() {
            return Err(SessionError::EmptyCommand);
        }
        if !config.cwd.is_absolute() {
            return Err(SessionError::RelativeCwd { path: config.cwd });
        }

        let session_id = Uuid::new_v4().to_string();
        let session_dir = paths::session_dir_under(&self.control_dir, &session_id);
        fs::create_dir_all(&session_dir)
            .await
            .map_err(|source| SessionError::SpawnFailed {
                session_id: session_id.clone(),
                source,
            })?;

        let mut session = Session::new(session_id.clone(), config.clone());
        let stream_path = paths::stream_path_under(&self.control_dir, &session_id);

        let pty = PtyHandle::spawn(&session_id, &config, stream_path.clone(), Arc::clone(&self.detector)).await;

        let (pty, materializer) = match pty {
            Ok(pty) => {
                session.mark_running(0);
                let watcher = StreamWatcher::new(session_id.clone(), stream_path, Arc::clone(&self.dedup));
                let materializer = Arc::new(Materializer::new(session_id.clone(), Arc::clone(&self.dedup)));
                materializer::spawn_pipeline(watcher, Arc::clone(&materializer));
                (Some(pty), Some(materializer))
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&session_dir).await;
                return Err(err);
            }
        };

        self.write_meta(&session).await.map_err(|source| {
            SessionError::Io(crate::errors::IoError::Stream {
                session_id: session_id.clone(),
                path: paths::meta_path_under(&self.control_dir, &session_id),
                source,
            })
        })?;

        self.sessions.write().await.insert(
            session_id.clone(),
            Arc::new(Mutex::new(ManagedSession { session, pty, materializer })),
        );

        let session_socket_path = paths::session_socket_path_under(&self.control_dir, &session_id);
        let manager = Arc::clone(self);
        let socket_session_id = session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_session_socket(manager, socket_session_id.clone(), &session_socket_path).await {
                tracing::warn!(session_id = %socket_session_id, error = %err, "session control socket stopped");
            }
        });

        Ok(session_id)
    }

    async fn write_meta(&self, session: &Session) -> std::io::Result<()> {
        let path = paths::meta_path_under(&self.control_dir, &session.id);
        let json = serde_json::to_string_pretty(session)?;
        fs::write(path, json).await
    }

    /// List every session known to the control directory, with status
    /// derived from the live child where one is still tracked.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the control directory cannot be walked.
    pub async fn list(&self) -> std::io::Result<Vec<SessionInfo>> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            let managed = entry.lock().await;
            let derived_status = match &managed.pty {
                Some(pty) => match pty.status().await {
                    PtyStatus::Running => SessionStatus::Running,
                    PtyStatus::Exited(_) => SessionStatus::Exited,
                },
                None => managed.session.status,
            };
            out.push(SessionInfo {
                session: managed.session.clone(),
                derived_status,
            });
        }
        Ok(out)
    }

    /// Look up a session's PTY handle for attach/write/resize operations.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no such session is registered.
    pub async fn attach(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        let sessions = self.sessions.read().await;
        if sessions.contains_key(session_id) {
            Ok(paths::stream_path_under(&self.control_dir, session_id))
        } else {
            Err(SessionError::NotFound {
                session_id: session_id.to_owned(),
            })
        }
    }

    /// Forward bytes to a session's PTY stdin (control-socket `STDIN`
    /// frames, §4.H).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no such session is registered.
    pub async fn write_stdin(&self, session_id: &str, bytes: Vec<u8>) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_owned(),
        })?;
        let managed = entry.lock().await;
        if let Some(pty) = &managed.pty {
            pty.write(bytes).await.map_err(|source| {
                SessionError::Io(crate::errors::IoError::Pty {
                    session_id: session_id.to_owned(),
                    source,
                })
            })?;
        }
        Ok(())
    }

    /// Resize a session's PTY (control-socket `RESIZE` frames, §4.H).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no such session is registered.
    pub async fn resize(&self, session_id: &str, cols: u32, rows: u32) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_owned(),
        })?;
        let mut managed = entry.lock().await;
        if let Some(pty) = &managed.pty {
            pty.resize(cols, rows).await.map_err(|source| {
                SessionError::Io(crate::errors::IoError::Pty {
                    session_id: session_id.to_owned(),
                    source,
                })
            })?;
        }
        managed.session.apply_resize(cols, rows);
        self.write_meta(&managed.session).await.map_err(|source| {
            SessionError::Io(crate::errors::IoError::Stream {
                session_id: session_id.to_owned(),
                path: paths::meta_path_under(&self.control_dir, session_id),
                source,
            })
        })?;
        Ok(())
    }

    /// Send `signal` to a session's child process.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no such session is registered.
    pub async fn kill(&self, session_id: &str, signal: i32) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_owned(),
        })?;
        let managed = entry.lock().await;
        if let Some(pty) = &managed.pty {
            pty.kill(signal).map_err(|source| {
                SessionError::Io(crate::errors::IoError::Pty {
                    session_id: session_id.to_owned(),
                    source,
                })
            })?;
        }
        Ok(())
    }

    /// Remove directories for sessions whose children are gone and whose
    /// streams are older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a directory could not be removed.
    pub async fn cleanup(&self, max_age: Duration) -> std::io::Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();

        for (id, entry) in sessions.iter() {
            let managed = entry.lock().await;
            let exited = match &managed.pty {
                Some(pty) => matches!(pty.status().await, PtyStatus::Exited(_)),
                None => matches!(managed.session.status, SessionStatus::Exited),
            };
            if !exited {
                continue;
            }
            let stream_path = paths::stream_path_under(&self.control_dir, id);
            let age_ok = fs::metadata(&stream_path)
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if age_ok {
                to_remove.push(id.clone());
            }
        }

        for id in to_remove {
            sessions.remove(&id);
            fs::remove_dir_all(paths::session_dir_under(&self.control_dir, &id)).await?;
            self.dedup.clear_session(&id);
            removed.push(id);
        }

        Ok(removed)
    }
}

#[async_trait]
impl LocalSnapshotSource for SessionManager {
    /// Look up a locally-registered session's snapshot feed for the
    /// aggregator (§4.G). Sessions without a live materializer (exited and
    /// not yet reaped) report no feed.
    async fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<Option<Arc<BufferSnapshot>>>> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        let managed = entry.lock().await;
        managed.materializer.as_ref().map(|m| m.subscribe_snapshots())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(argv: Vec<&str>, cwd: PathBuf) -> SessionConfig {
        SessionConfig {
            argv: argv.into_iter().map(ToOwned::to_owned).collect(),
            cwd,
            env: Vec::new(),
            name: "test".to_owned(),
            cols: 80,
            rows: 24,
            title_mode: crate::session::TitleMode::None,
            git: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).ok();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let err = manager.create(config(vec![], PathBuf::from("/tmp"))).await.unwrap_err();
        assert!(matches!(err, SessionError::EmptyCommand));
    }

    #[tokio::test]
    async fn create_rejects_relative_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("control")).await.unwrap());
        let err = manager
            .create(config(vec!["sh"], PathBuf::from("relative")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RelativeCwd { .. }));
    }

    #[tokio::test]
    async fn attach_unknown_session_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().join("control")).await.unwrap();
        let err = manager.attach("nope").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }
}
