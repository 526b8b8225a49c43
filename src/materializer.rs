//! Terminal materializer (§4.F): drives a headless VT100 emulator from
//! asciinema events and emits binary buffer snapshots with backpressure.
//!
//! One materializer per session. Output is batched (default 10 events per
//! ~10ms tick) before being fed to the emulator; a 50ms debounce coalesces
//! the resulting snapshot emissions. Flow control watermarks (§5, §8
//! property 4) are tracked here and exposed via [`Materializer::pause_signal`]
//! for the stream watcher (§4.E) to observe.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch, Mutex};

use crate::asciinema::{AsciinemaEvent, StreamLine};
use crate::dedup::ErrorDedup;
use crate::snapshot::{BufferSnapshot, Cell};
use crate::stream_watcher::{StreamWatcher, WatchEvent};

/// Initial emulator width (§4.F).
pub const DEFAULT_COLS: u16 = 80;
/// Initial emulator height (§4.F).
pub const DEFAULT_ROWS: u16 = 24;
/// Scrollback depth (§4.F).
pub const SCROLLBACK_LINES: usize = 10_000;

/// Batch size before a forced emulator feed (§4.F write pipeline).
pub const BATCH_SIZE: usize = 10;
/// Maximum gap between batches before a partial batch is flushed anyway.
pub const BATCH_GAP: Duration = Duration::from_millis(10);
/// Debounce window coalescing snapshot emissions.
pub const DEBOUNCE: Duration = Duration::from_millis(50);

/// High watermark: above this buffer utilization, request the stream
/// watcher to pause (§5, §8 property 4).
pub const HIGH_WATERMARK: f64 = 0.80;
/// Low watermark: at or below this, resume.
pub const LOW_WATERMARK: f64 = 0.50;
/// Bound on the watcher's pending-line queue while paused.
pub const MAX_PENDING_LINES: usize = 10_000;
/// Longest a pause may last before the pending queue is dropped.
pub const PAUSE_DROP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Whether the stream watcher should keep delivering events or pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// Keep delivering.
    Resume,
    /// Stop delivering until the next `Resume`.
    Pause,
}

/// Drives one session's headless terminal emulator.
pub struct Materializer {
    session_id: String,
    screen: Mutex<vt100::Parser>,
    pending_batch: Mutex<Vec<u8>>,
    last_batch_at: Mutex<Instant>,
    snapshot_tx: watch::Sender<Option<Arc<BufferSnapshot>>>,
    flow_tx: watch::Sender<FlowSignal>,
    pending_lines: Mutex<usize>,
    paused_since: Mutex<Option<Instant>>,
    dedup: Arc<ErrorDedup>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    /// Create a materializer for `session_id`.
    #[must_use]
    pub fn new(session_id: String, dedup: Arc<ErrorDedup>) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        let (flow_tx, _) = watch::channel(FlowSignal::Resume);
        Self {
            session_id,
            screen: Mutex::new(vt100::Parser::new(DEFAULT_ROWS, DEFAULT_COLS, SCROLLBACK_LINES)),
            pending_batch: Mutex::new(Vec::new()),
            last_batch_at: Mutex::new(Instant::now()),
            snapshot_tx,
            flow_tx,
            pending_lines: Mutex::new(0),
            paused_since: Mutex::new(None),
            dedup,
        }
    }

    /// Subscribe to snapshot emissions; `None` until the first flush.
    #[must_use]
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<Arc<BufferSnapshot>>> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to flow-control pause/resume signals (§4.E/§4.F contract).
    #[must_use]
    pub fn subscribe_flow(&self) -> watch::Receiver<FlowSignal> {
        self.flow_tx.subscribe()
    }

    /// Apply one asciinema event from the tailed stream.
    pub async fn apply_event(&self, event: &AsciinemaEvent) {
        match event {
            AsciinemaEvent::Output { data, .. } => {
                self.feed(data.as_bytes()).await;
            }
            AsciinemaEvent::Resize { cols, rows, .. } => {
                self.flush_batch().await;
                let mut screen = self.screen.lock().await;
                screen.set_size(
                    u16::try_from(*rows).unwrap_or(u16::MAX),
                    u16::try_from(*cols).unwrap_or(u16::MAX),
                );
                drop(screen);
                self.emit_snapshot().await;
            }
            AsciinemaEvent::Input { .. } => {}
        }
    }

    async fn feed(&self, bytes: &[u8]) {
        let mut batch = self.pending_batch.lock().await;
        batch.extend_from_slice(bytes);
        let should_flush = {
            let last = *self.last_batch_at.lock().await;
            batch.len() >= BATCH_SIZE || last.elapsed() >= BATCH_GAP
        };
        drop(batch);
        if should_flush {
            self.flush_batch().await;
        }
    }

    async fn flush_batch(&self) {
        let mut batch = self.pending_batch.lock().await;
        if batch.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut *batch);
        drop(batch);

        {
            let mut screen = self.screen.lock().await;
            screen.process(&bytes);
        }
        *self.last_batch_at.lock().await = Instant::now();
        self.update_watermark().await;
        self.emit_snapshot().await;
    }

    async fn update_watermark(&self) {
        let utilization = {
            let screen = self.screen.lock().await;
            let used = screen.screen().scrollback().min(SCROLLBACK_LINES);
            #[expect(clippy::cast_precision_loss, reason = "scrollback counts fit comfortably in f64")]
            let ratio = used as f64 / SCROLLBACK_LINES as f64;
            ratio
        };

        let current = *self.flow_tx.borrow();
        if utilization >= HIGH_WATERMARK && current == FlowSignal::Resume {
            let _ = self.flow_tx.send(FlowSignal::Pause);
            *self.paused_since.lock().await = Some(Instant::now());
        } else if utilization <= LOW_WATERMARK && current == FlowSignal::Pause {
            self.resume().await;
        }

        if let Some(since) = *self.paused_since.lock().await {
            if since.elapsed() >= PAUSE_DROP_TIMEOUT {
                self.dedup.record(
                    &self.session_id,
                    "flow_control",
                    "pending queue dropped after exceeding pause timeout",
                );
                *self.pending_lines.lock().await = 0;
                self.resume().await;
            }
        }
    }

    async fn resume(&self) {
        let _ = self.flow_tx.send(FlowSignal::Resume);
        *self.paused_since.lock().await = None;
        *self.pending_lines.lock().await = 0;
    }

    /// Record that the watcher enqueued one more pending line while paused;
    /// returns `false` once [`MAX_PENDING_LINES`] is exceeded, signalling
    /// the caller to drop instead of enqueue (§5 overflow policy).
    pub async fn record_pending_line(&self) -> bool {
        let mut pending = self.pending_lines.lock().await;
        if *pending >= MAX_PENDING_LINES {
            return false;
        }
        *pending += 1;
        true
    }

    async fn emit_snapshot(&self) {
        let last_emit_gap = {
            let last = *self.last_batch_at.lock().await;
            last.elapsed()
        };
        if last_emit_gap < DEBOUNCE {
            tokio::time::sleep(DEBOUNCE - last_emit_gap).await;
        }
        let snapshot = self.snapshot().await;
        let _ = self.snapshot_tx.send(Some(Arc::new(snapshot)));
    }

    /// Extract the current buffer snapshot, O(rows x cols) (§4.F).
    pub async fn snapshot(&self) -> BufferSnapshot {
        let screen = self.screen.lock().await;
        let contents = screen.screen();
        let (rows, cols) = contents.size();
        let cursor = contents.cursor_position();

        let mut grid = Vec::with_capacity(rows as usize);
        for row in 0..rows {
            let mut cells = Vec::with_capacity(cols as usize);
            for col in 0..cols {
                cells.push(vt100_cell_to_snapshot_cell(contents.cell(row, col)));
            }
            grid.push(cells);
        }

        BufferSnapshot::from_grid(
            u32::from(cols),
            u32::from(rows),
            0,
            i32::from(cursor.1),
            i32::from(cursor.0),
            grid,
        )
    }
}

/// Pump one session's tailed stream into its materializer, honoring the
/// flow-control contract between §4.E and §4.F: replay is always applied
/// immediately (it is bounded catch-up from disk), while live events are
/// queued locally once the materializer signals [`FlowSignal::Pause`] and
/// drained again once it signals [`FlowSignal::Resume`] (§5, §8 property 4).
pub fn spawn_pipeline(watcher: Arc<StreamWatcher>, materializer: Arc<Materializer>) {
    tokio::spawn(async move {
        let Ok((mut replay_rx, mut live_rx)) = watcher.subscribe().await else {
            return;
        };
        while let Some(event) = replay_rx.recv().await {
            apply_watch_event(&materializer, event).await;
        }

        let mut flow_rx = materializer.subscribe_flow();
        let mut pending: VecDeque<WatchEvent> = VecDeque::new();

        loop {
            tokio::select! {
                event = live_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if *flow_rx.borrow() == FlowSignal::Pause {
                                if materializer.record_pending_line().await {
                                    pending.push_back(event);
                                }
                            } else {
                                apply_watch_event(&materializer, event).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = flow_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *flow_rx.borrow() == FlowSignal::Resume {
                        while let Some(event) = pending.pop_front() {
                            apply_watch_event(&materializer, event).await;
                        }
                    }
                }
            }
        }
    });
}

async fn apply_watch_event(materializer: &Materializer, event: WatchEvent) {
    match event {
        WatchEvent::Header(header) => {
            materializer
                .apply_event(&AsciinemaEvent::Resize {
                    elapsed: 0.0,
                    cols: header.width,
                    rows: header.height,
                })
                .await;
        }
        WatchEvent::Line(StreamLine::Event(event)) => materializer.apply_event(&event).await,
        WatchEvent::Line(StreamLine::Header(_) | StreamLine::Exit { .. }) => {}
    }
}

fn vt100_cell_to_snapshot_cell(cell: Option<&vt100::Cell>) -> Cell {
    let Some(cell) = cell.filter(|c| !c.is_wide_continuation()) else {
        return Cell::blank();
    };

    let contents = cell.contents();
    let ch = contents.chars().next().unwrap_or(' ');
    let width = if cell.is_wide() { 2 } else { 1 };

    let mut attributes = 0u8;
    if cell.bold() {
        attributes |= crate::snapshot::attrs::BOLD;
    }
    if cell.italic() {
        attributes |= crate::snapshot::attrs::ITALIC;
    }
    if cell.underline() {
        attributes |= crate::snapshot::attrs::UNDERLINE;
    }
    if cell.inverse() {
        attributes |= crate::snapshot::attrs::INVERSE;
    }

    Cell {
        ch,
        width,
        fg: vt100_color_to_snapshot_color(cell.fgcolor()),
        bg: vt100_color_to_snapshot_color(cell.bgcolor()),
        attributes,
    }
}

fn vt100_color_to_snapshot_color(color: vt100::Color) -> Option<crate::snapshot::Color> {
    match color {
        vt100::Color::Default => None,
        vt100::Color::Idx(idx) => Some(crate::snapshot::Color::Palette(idx)),
        vt100::Color::Rgb(r, g, b) => Some(crate::snapshot::Color::Rgb(r, g, b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feeding_plain_text_surfaces_it_in_snapshot() {
        let materializer = Materializer::new("sess1".to_owned(), Arc::new(ErrorDedup::new()));
        materializer
            .apply_event(&AsciinemaEvent::Output {
                elapsed: 0.0,
                data: "hello".to_owned(),
            })
            .await;
        materializer.flush_batch().await;
        let snapshot = materializer.snapshot().await;
        let text: String = snapshot.cell_rows[0].iter().map(|c| c.ch).collect();
        assert!(text.starts_with("hello"));
    }

    #[tokio::test]
    async fn resize_updates_screen_dimensions() {
        let materializer = Materializer::new("sess1".to_owned(), Arc::new(ErrorDedup::new()));
        materializer
            .apply_event(&AsciinemaEvent::Resize {
                elapsed: 0.0,
                cols: 120,
                rows: 40,
            })
            .await;
        let snapshot = materializer.snapshot().await;
        assert_eq!(snapshot.cols, 120);
        assert_eq!(snapshot.rows, 40);
    }

    #[tokio::test]
    async fn pending_line_tracking_respects_max_and_resets_on_resume() {
        let materializer = Materializer::new("sess1".to_owned(), Arc::new(ErrorDedup::new()));
        for _ in 0..MAX_PENDING_LINES {
            assert!(materializer.record_pending_line().await);
        }
        assert!(!materializer.record_pending_line().await);
        materializer.resume().await;
        assert!(materializer.record_pending_line().await);
    }
}
