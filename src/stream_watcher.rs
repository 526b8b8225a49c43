//! Stream watcher (§4.E): tails a session's `stdout` file, fans new events
//! out to subscribers, and handles prune-on-clear replay for new
//! subscribers.
//!
//! Per §9's file-watching note, this module owns only the *subscription and
//! delivery* half of tailing; the *logical offset* into the stream is the
//! materializer's (§4.F) concern once events reach it. The watcher itself
//! tracks only the byte offset it has read up to, which is a distinct,
//! lower-level notion than "how far the emulator has replayed".

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::asciinema::{self, AsciinemaHeader, StreamLine};
use crate::dedup::ErrorDedup;

/// Idle delay before tearing down a watcher once its last subscriber drops
/// (§4.E shutdown).
pub const IDLE_TEARDOWN_DELAY: Duration = Duration::from_secs(5);

/// Polling fallback interval, used alongside `notify` in case a platform's
/// change notifications are unreliable for this file (§4.E).
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

const SEQUENCE_CLEAR: &str = "\u{1b}[3J";

/// One line delivered to a subscriber: either the (possibly rewritten)
/// header or a data/exit line, tagged with whether it is replay ("catch
/// up", always timestamp 0) or live.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The stream's header, rewritten per prune-on-clear if applicable.
    Header(AsciinemaHeader),
    /// A data or exit line.
    Line(StreamLine),
}

/// Shared state for one stream file, fanning events out to every
/// subscriber via a broadcast channel.
pub struct StreamWatcher {
    path: PathBuf,
    tx: broadcast::Sender<WatchEvent>,
    dedup: Arc<ErrorDedup>,
    session_id: String,
}

impl std::fmt::Debug for StreamWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StreamWatcher {
    /// Start watching `path`. Does not read any content until
    /// [`Self::subscribe`] is called.
    #[must_use]
    pub fn new(session_id: String, path: PathBuf, dedup: Arc<ErrorDedup>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        let watcher = Arc::new(Self {
            path,
            tx,
            dedup,
            session_id,
        });
        tokio::spawn(tail_loop(Arc::clone(&watcher)));
        watcher
    }

    /// Subscribe: replay the stream with pruning applied, then receive live
    /// events thereafter.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the stream file cannot be opened.
    pub async fn subscribe(&self) -> std::io::Result<(mpsc::Receiver<WatchEvent>, broadcast::Receiver<WatchEvent>)> {
        let live_rx = self.tx.subscribe();
        let (replay_tx, replay_rx) = mpsc::channel(256);
        let lines = read_all_lines(&self.path).await?;
        for event in replay_events(&lines) {
            if replay_tx.send(event).await.is_err() {
                break;
            }
        }
        Ok((replay_rx, live_rx))
    }
}

async fn read_all_lines(path: &PathBuf) -> std::io::Result<Vec<String>> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches('\n');
        if !trimmed.is_empty() {
            lines.push(trimmed.to_owned());
        }
    }
    Ok(lines)
}

/// Apply prune-on-clear (§4.E, §8 property 3) to a fully-read line set and
/// return the events a new subscriber should receive.
fn replay_events(lines: &[String]) -> Vec<WatchEvent> {
    if lines.is_empty() {
        return Vec::new();
    }

    let Ok(header) = asciinema::parse_header(&lines[0]) else {
        return Vec::new();
    };

    let mut parsed = Vec::new();
    for line in &lines[1..] {
        if let Ok(event) = asciinema::parse_line(line) {
            parsed.push(event);
        }
    }

    let clear_index = parsed.iter().rposition(|event| {
        matches!(event, StreamLine::Event(crate::asciinema::AsciinemaEvent::Output { data, .. }) if data.contains(SEQUENCE_CLEAR))
    });

    let Some(clear_index) = clear_index else {
        let mut out = Vec::with_capacity(parsed.len() + 1);
        out.push(WatchEvent::Header(header));
        out.extend(parsed.into_iter().map(WatchEvent::Line));
        return out;
    };

    let last_resize = parsed[..=clear_index].iter().rev().find_map(|event| {
        if let StreamLine::Event(crate::asciinema::AsciinemaEvent::Resize { cols, rows, .. }) = event {
            Some((*cols, *rows))
        } else {
            None
        }
    });

    let rewritten_header = last_resize.map_or_else(
        || header.clone(),
        |(cols, rows)| header.clone().with_dimensions(cols, rows),
    );

    let mut out = vec![WatchEvent::Header(rewritten_header)];
    out.extend(parsed.into_iter().skip(clear_index + 1).map(|event| {
        let event = match event {
            StreamLine::Event(e) => StreamLine::Event(e.with_elapsed(0.0)),
            other => other,
        };
        WatchEvent::Line(event)
    }));
    out
}

async fn tail_loop(watcher: Arc<StreamWatcher>) {
    let Ok(file) = File::open(&watcher.path).await else {
        return;
    };
    let mut reader = BufReader::new(file);
    let Ok(mut offset) = reader.seek(std::io::SeekFrom::End(0)).await else {
        return;
    };

    let (notify_tx, mut notify_rx) = mpsc::channel(16);
    let mut fs_watcher: Option<RecommendedWatcher> = notify::recommended_watcher(move |res| {
        if res.is_ok() {
            let _ = notify_tx.try_send(());
        }
    })
    .ok();
    if let Some(w) = fs_watcher.as_mut() {
        let _ = w.watch(&watcher.path, RecursiveMode::NonRecursive);
    }

    let mut buf = String::new();

    loop {
        tokio::select! {
            _ = notify_rx.recv() => {}
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        loop {
            buf.clear();
            let n = match reader.read_line(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            offset += n as u64;
            let trimmed = buf.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }
            match asciinema::parse_line(trimmed) {
                Ok(event) => {
                    let _ = watcher.tx.send(WatchEvent::Line(event));
                }
                Err(err) => watcher.dedup.record(&watcher.session_id, "stream_parse", &err.reason),
            }
        }

        if watcher.tx.receiver_count() == 0 {
            tokio::time::sleep(IDLE_TEARDOWN_DELAY).await;
            if watcher.tx.receiver_count() == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asciinema::AsciinemaEvent;

    fn header_line() -> String {
        serde_json::to_string(&AsciinemaHeader::new(80, 24)).unwrap()
    }

    fn event_line(event: &AsciinemaEvent) -> String {
        match event {
            AsciinemaEvent::Output { elapsed, data } => {
                format!("[{elapsed},\"o\",{}]", serde_json::to_string(data).unwrap())
            }
            _ => unreachable!("test only uses output events"),
        }
    }

    #[test]
    fn replay_with_no_clear_returns_everything() {
        let lines = vec![
            header_line(),
            event_line(&AsciinemaEvent::Output {
                elapsed: 0.0,
                data: "hi".to_owned(),
            }),
        ];
        let events = replay_events(&lines);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WatchEvent::Header(_)));
    }

    #[test]
    fn replay_prunes_events_up_to_and_including_clear() {
        let lines = vec![
            header_line(),
            serde_json::to_string(&serde_json::json!([1.0, "r", "120x30"])).unwrap(),
            serde_json::to_string(&serde_json::json!([2.0, "o", "before\u{1b}[3Jclear"])).unwrap(),
            serde_json::to_string(&serde_json::json!([3.0, "o", "after1"])).unwrap(),
            serde_json::to_string(&serde_json::json!([4.0, "o", "after2"])).unwrap(),
        ];
        let events = replay_events(&lines);
        // header + 2 surviving events
        assert_eq!(events.len(), 3);
        let WatchEvent::Header(header) = &events[0] else {
            panic!("expected header first")
        };
        assert_eq!(header.width, 120);
        assert_eq!(header.height, 30);
    }

    #[test]
    fn empty_stream_produces_no_events() {
        assert!(replay_events(&[]).is_empty());
    }
}
