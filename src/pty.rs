//! PTY session lifecycle (§4.C).
//!
//! Spawns the session's command under a freshly allocated PTY, mirrors all
//! master output to the session's asciinema stream file, and exposes
//! `write`/`resize`/`kill`/`status` to the session manager (§4.D). Title
//! injection and OSC stripping are applied to the bytes before they reach
//! the stream file — the stream file is the one artifact every subscriber
//! eventually reads, so that is the only place injection needs to happen.

use std::path::PathBuf;
use std::sync::Arc;

use pty_process::{Command as PtyCommand, Size};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::asciinema::{AsciinemaHeader, AsciinemaWriter};
use crate::detector::Detector;
use crate::errors::{IoError, SessionError};
use crate::session::{SessionConfig, TitleMode};

const READ_BUFFER_SIZE: usize = 4096;

/// Requests sent to the PTY writer task (§4.C: `write`, `resize`, `kill`).
#[derive(Debug)]
enum WriteRequest {
    Input(Vec<u8>),
    Resize(u32, u32),
}

/// Exit code recorded when the PTY master closes without an observed child
/// exit status (§4.C failure semantics).
pub const UNEXPECTED_CLOSE_EXIT_CODE: i32 = 255;

/// A spawned PTY session. Cloning shares the same underlying child and
/// stream file.
#[derive(Debug, Clone)]
pub struct PtyHandle {
    write_tx: mpsc::Sender<WriteRequest>,
    resize_record_tx: mpsc::Sender<(u32, u32)>,
    status: Arc<Mutex<PtyStatus>>,
    pid: u32,
    cancel: CancellationToken,
}

/// Runtime status tracked independently of `session::Session`, since the
/// reader/writer tasks update it without holding the manager's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyStatus {
    /// Child is alive.
    Running,
    /// Child reaped with this exit code.
    Exited(i32),
}

impl PtyHandle {
    /// Spawn `config.argv` under a new PTY and begin mirroring its output to
    /// `stream_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EmptyCommand`] if `argv` is empty,
    /// [`SessionError::SpawnFailed`] if the PTY or child could not be
    /// created, or a wrapped [`IoError`] if the stream file could not be
    /// opened.
    pub async fn spawn(
        session_id: &str,
        config: &SessionConfig,
        stream_path: PathBuf,
        detector: Arc<Detector>,
    ) -> Result<Self, SessionError> {
        let Some(program) = config.argv.first() else {
            return Err(SessionError::EmptyCommand);
        };

        let (mut pty, pts) = pty_process::open().map_err(|e| SessionError::SpawnFailed {
            session_id: session_id.to_owned(),
            source: std::io::Error::other(e.to_string()),
        })?;
        pty.resize(Size::new(
            u16::try_from(config.rows).unwrap_or(u16::MAX),
            u16::try_from(config.cols).unwrap_or(u16::MAX),
        ))
        .map_err(|e| SessionError::SpawnFailed {
            session_id: session_id.to_owned(),
            source: std::io::Error::other(e.to_string()),
        })?;

        let mut cmd = PtyCommand::new(program);
        cmd.args(&config.argv[1..]);
        cmd.current_dir(&config.cwd);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn(pts).map_err(|e| SessionError::SpawnFailed {
            session_id: session_id.to_owned(),
            source: std::io::Error::other(e.to_string()),
        })?;

        let writer = AsciinemaWriter::create(&stream_path, AsciinemaHeader::new(config.cols, config.rows))
            .await
            .map_err(|source| {
                SessionError::Io(IoError::Stream {
                    session_id: session_id.to_owned(),
                    path: stream_path.clone(),
                    source,
                })
            })?;

        let (pty_reader, pty_writer) = pty.into_split();
        let (write_tx, write_rx) = mpsc::channel(256);
        let (resize_record_tx, resize_record_rx) = mpsc::channel(16);
        let status = Arc::new(Mutex::new(PtyStatus::Running));
        let cancel = CancellationToken::new();
        let title_mode = config.title_mode;

        let pid = child.id().unwrap_or(0);

        tokio::spawn(reader_loop(
            pty_reader,
            writer,
            resize_record_rx,
            detector,
            title_mode,
            session_id.to_owned(),
            Arc::clone(&status),
            cancel.clone(),
        ));
        tokio::spawn(writer_loop(pty_writer, write_rx, cancel.clone()));
        tokio::spawn(reap_loop(child, Arc::clone(&status), cancel.clone()));

        Ok(Self {
            write_tx,
            resize_record_tx,
            status,
            pid,
            cancel,
        })
    }

    /// Forward bytes to the PTY master (child stdin).
    ///
    /// # Errors
    ///
    /// Returns an error if the writer task has already shut down.
    pub async fn write(&self, bytes: Vec<u8>) -> std::io::Result<()> {
        self.write_tx
            .send(WriteRequest::Input(bytes))
            .await
            .map_err(|_| std::io::Error::other("PTY writer task closed"))
    }

    /// Resize the PTY and record a `"r"` event (§4.C, §3).
    ///
    /// The event is recorded by the reader task (it owns the asciinema
    /// writer) while the writer task performs the actual ioctl; a dead
    /// reader task only drops the recorded event; the ioctl result is what
    /// this call reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer task has already shut down.
    pub async fn resize(&self, cols: u32, rows: u32) -> std::io::Result<()> {
        let _ = self.resize_record_tx.send((cols, rows)).await;
        self.write_tx
            .send(WriteRequest::Resize(cols, rows))
            .await
            .map_err(|_| std::io::Error::other("PTY writer task closed"))
    }

    /// Send a signal to the child process.
    ///
    /// # Errors
    ///
    /// Returns the raw `errno` from `kill(2)` on failure.
    pub fn kill(&self, signal: i32) -> std::io::Result<()> {
        #[expect(unsafe_code, reason = "libc::kill has no safe wrapper")]
        // SAFETY: `kill(2)` with a pid/signal pair has no memory-safety
        // preconditions; failure is reported via errno, not UB.
        let result = unsafe { libc::kill(libc::pid_t::try_from(self.pid).unwrap_or(0), signal) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Current runtime status.
    pub async fn status(&self) -> PtyStatus {
        *self.status.lock().await
    }

    /// Tear down the reader/writer/reap tasks without waiting for the
    /// child; used by the session manager's `kill` once a signal has been
    /// sent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn reap_loop(
    mut child: pty_process::Child,
    status: Arc<Mutex<PtyStatus>>,
    cancel: CancellationToken,
) {
    tokio::select! {
        result = child.wait() => {
            let code = result.ok().and_then(|s| s.code()).unwrap_or(UNEXPECTED_CLOSE_EXIT_CODE);
            *status.lock().await = PtyStatus::Exited(code);
            cancel.cancel();
        }
        () = cancel.cancelled() => {}
    }
}

async fn writer_loop(
    mut writer: pty_process::OwnedWritePty,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            request = write_rx.recv() => {
                match request {
                    Some(WriteRequest::Input(bytes)) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(WriteRequest::Resize(cols, rows)) => {
                        let size = Size::new(
                            u16::try_from(rows).unwrap_or(u16::MAX),
                            u16::try_from(cols).unwrap_or(u16::MAX),
                        );
                        if writer.resize(size).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn reader_loop(
    mut reader: pty_process::OwnedReadPty,
    mut writer: AsciinemaWriter,
    mut resize_record_rx: mpsc::Receiver<(u32, u32)>,
    detector: Arc<Detector>,
    title_mode: TitleMode,
    session_id: String,
    status: Arc<Mutex<PtyStatus>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending_title = false;
    let mut resize_channel_open = true;

    loop {
        tokio::select! {
            resize = resize_record_rx.recv(), if resize_channel_open => {
                match resize {
                    Some((cols, rows)) => {
                        if writer.write_resize(cols, rows).await.is_err() {
                            break;
                        }
                    }
                    None => resize_channel_open = false,
                }
            }
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        let detection = detector.detect(&text, &buf[..n]);

                        let chunk = match title_mode {
                            TitleMode::None => buf[..n].to_vec(),
                            TitleMode::Filter => strip_osc_0_1_2(&buf[..n]),
                            TitleMode::Static | TitleMode::Dynamic => {
                                let mut out = buf[..n].to_vec();
                                if pending_title {
                                    let title = format!("{} \u{2014} {}", session_id, detection.status.as_ref().map_or("idle", |s| s.action.as_str()));
                                    let mut prefixed = build_osc2(&title);
                                    prefixed.extend_from_slice(&out);
                                    out = prefixed;
                                    pending_title = false;
                                }
                                out
                            }
                        };
                        pending_title = pending_title || detection.ends_with_prompt;

                        if writer.write_output(&chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }

    let exit_code = match *status.lock().await {
        PtyStatus::Exited(code) => code,
        PtyStatus::Running => UNEXPECTED_CLOSE_EXIT_CODE,
    };
    let _ = writer.write_exit(exit_code, &session_id).await;
}

/// Build an OSC 2 (set window title) escape sequence.
#[must_use]
pub fn build_osc2(title: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(title.len() + 5);
    out.extend_from_slice(b"\x1b]2;");
    out.extend_from_slice(title.as_bytes());
    out.push(0x07);
    out
}

/// Strip OSC 0/1/2 sequences (`ESC ] {0,1,2} ; ... BEL|ST`) from `bytes`,
/// used in `filter` title mode.
#[must_use]
pub fn strip_osc_0_1_2(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b']') {
            let kind_start = i + 2;
            if matches!(bytes.get(kind_start), Some(b'0' | b'1' | b'2')) && bytes.get(kind_start + 1) == Some(&b';') {
                let mut j = kind_start + 2;
                while j < bytes.len() && bytes[j] != 0x07 {
                    if bytes[j] == 0x1b && bytes.get(j + 1) == Some(&b'\\') {
                        j += 1;
                        break;
                    }
                    j += 1;
                }
                i = (j + 1).min(bytes.len());
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
