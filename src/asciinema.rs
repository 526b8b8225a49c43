//! Asciinema v2 writer/reader (§4.B, §6).
//!
//! The stream file is opened for exclusive append; the first write is the
//! header, every subsequent line is one JSON-encoded event, and a
//! `["exit", code, id]` terminator is appended once the child reaps.
//! Readers are tolerant: a line that fails to parse is skipped and logged
//! once per session via the error-dedup sink (§4.K), never treated as fatal.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// First line of a stream file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsciinemaHeader {
    /// Format version; always 2.
    pub version: u32,
    /// Terminal width in columns at recording start.
    pub width: u32,
    /// Terminal height in rows at recording start.
    pub height: u32,
    /// Unix timestamp the recording started, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Environment variables captured at recording start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

impl AsciinemaHeader {
    /// Build a header for a freshly created stream.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            version: 2,
            width,
            height,
            timestamp: Some(chrono::Utc::now().timestamp()),
            env: None,
        }
    }

    /// Return a copy of this header with width/height overridden.
    ///
    /// Used by the stream watcher (§4.E) to rewrite the header delivered to
    /// a subscriber so it carries the dimensions of the last resize before
    /// a scrollback clear.
    #[must_use]
    pub const fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// One data-line event (§3). `elapsed` is seconds since stream start and
/// must be monotonically non-decreasing within one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AsciinemaEvent {
    /// Bytes written from the PTY master to the client ("o").
    Output {
        /// Seconds since stream start.
        elapsed: f64,
        /// Raw terminal output, lossily coerced to UTF-8.
        data: String,
    },
    /// Bytes written from the client to the PTY master ("i").
    Input {
        /// Seconds since stream start.
        elapsed: f64,
        /// Raw input bytes, lossily coerced to UTF-8.
        data: String,
    },
    /// A resize applied to the PTY ("r"), payload `"<cols>x<rows>"`.
    Resize {
        /// Seconds since stream start.
        elapsed: f64,
        /// New column count.
        cols: u32,
        /// New row count.
        rows: u32,
    },
}

impl AsciinemaEvent {
    /// Seconds since stream start this event was recorded at.
    #[must_use]
    pub const fn elapsed(&self) -> f64 {
        match self {
            Self::Output { elapsed, .. } | Self::Input { elapsed, .. } | Self::Resize { elapsed, .. } => {
                *elapsed
            }
        }
    }

    /// Re-stamp this event with a new elapsed time, used by the stream
    /// watcher to mark replayed events as timestamp 0 (§4.E).
    #[must_use]
    pub fn with_elapsed(self, elapsed: f64) -> Self {
        match self {
            Self::Output { data, .. } => Self::Output { elapsed, data },
            Self::Input { data, .. } => Self::Input { elapsed, data },
            Self::Resize { cols, rows, .. } => Self::Resize {
                elapsed,
                cols,
                rows,
            },
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Output { elapsed, data } => Value::Array(vec![
                json_number(*elapsed),
                Value::String("o".to_owned()),
                Value::String(data.clone()),
            ]),
            Self::Input { elapsed, data } => Value::Array(vec![
                json_number(*elapsed),
                Value::String("i".to_owned()),
                Value::String(data.clone()),
            ]),
            Self::Resize {
                elapsed,
                cols,
                rows,
            } => Value::Array(vec![
                json_number(*elapsed),
                Value::String("r".to_owned()),
                Value::String(format!("{cols}x{rows}")),
            ]),
        }
    }
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::from(0), Value::Number)
}

/// The terminator line appended once a session's child process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitMarker {
    /// The child's exit code.
    pub code: i32,
}

/// A fully parsed stream line: either the header or a data event or the
/// terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// The stream's header (always the first line).
    Header(AsciinemaHeader),
    /// A data-line event.
    Event(AsciinemaEvent),
    /// The `["exit", code, id]` terminator.
    Exit {
        /// Exit code of the recorded child process.
        code: i32,
        /// Session id the exit line names.
        session_id: String,
    },
}

/// Error returned by a line that failed to parse. Carries the raw line so
/// callers can log it once via the dedup sink (§4.K) and move on.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unparseable asciinema line: {reason}")]
pub struct ParseLineError {
    /// Why the line could not be parsed.
    pub reason: String,
}

/// Parse a single line as a header. Only valid for the first line of a
/// stream.
///
/// # Errors
///
/// Returns [`ParseLineError`] if the line is not a valid header object.
pub fn parse_header(line: &str) -> Result<AsciinemaHeader, ParseLineError> {
    serde_json::from_str(line).map_err(|e| ParseLineError {
        reason: e.to_string(),
    })
}

/// Parse a single data or terminator line.
///
/// # Errors
///
/// Returns [`ParseLineError`] if the line is not a well-formed `[elapsed,
/// kind, payload]` or `["exit", code, id]` array.
pub fn parse_line(line: &str) -> Result<StreamLine, ParseLineError> {
    let value: Value = serde_json::from_str(line).map_err(|e| ParseLineError {
        reason: e.to_string(),
    })?;

    let Value::Array(items) = value else {
        return Err(ParseLineError {
            reason: "line is not a JSON array".to_owned(),
        });
    };
    if items.len() != 3 {
        return Err(ParseLineError {
            reason: format!("expected 3 elements, found {}", items.len()),
        });
    }

    if items[0].as_str() == Some("exit") {
        let code = items[1].as_i64().ok_or_else(|| ParseLineError {
            reason: "exit code is not a number".to_owned(),
        })? as i32;
        let session_id = items[2]
            .as_str()
            .ok_or_else(|| ParseLineError {
                reason: "exit session id is not a string".to_owned(),
            })?
            .to_owned();
        return Ok(StreamLine::Exit { code, session_id });
    }

    let elapsed = items[0].as_f64().ok_or_else(|| ParseLineError {
        reason: "elapsed is not a number".to_owned(),
    })?;
    let kind = items[1].as_str().ok_or_else(|| ParseLineError {
        reason: "kind is not a string".to_owned(),
    })?;
    let payload = items[2].as_str().ok_or_else(|| ParseLineError {
        reason: "payload is not a string".to_owned(),
    })?;

    let event = match kind {
        "o" => AsciinemaEvent::Output {
            elapsed,
            data: payload.to_owned(),
        },
        "i" => AsciinemaEvent::Input {
            elapsed,
            data: payload.to_owned(),
        },
        "r" => {
            let (cols, rows) = parse_resize_payload(payload).ok_or_else(|| ParseLineError {
                reason: format!("malformed resize payload: {payload}"),
            })?;
            AsciinemaEvent::Resize {
                elapsed,
                cols,
                rows,
            }
        }
        other => {
            return Err(ParseLineError {
                reason: format!("unknown event kind: {other}"),
            });
        }
    };

    Ok(StreamLine::Event(event))
}

/// Parse a `"<cols>x<rows>"` resize payload.
#[must_use]
pub fn parse_resize_payload(payload: &str) -> Option<(u32, u32)> {
    let (cols, rows) = payload.split_once('x')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}

/// Writer half of a stream file: exclusive append, header-then-events,
/// monotonic elapsed time from a captured start instant.
#[derive(Debug)]
pub struct AsciinemaWriter {
    file: File,
    // held for the lifetime of the writer to keep the exclusive lock; the
    // std handle is never read from again once `file` is wrapped for async
    // writes.
    _lock: std::fs::File,
    started_at: Instant,
    header_written: bool,
}

impl AsciinemaWriter {
    /// Open `path` for exclusive append, creating it if needed, and write
    /// the header as the first line.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be opened, locked, or
    /// written to.
    pub async fn create(path: &Path, header: AsciinemaHeader) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lock_handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        lock_handle.try_lock_exclusive().map_err(|_| {
            std::io::Error::other(format!(
                "stream file {} already has a writer",
                path.display()
            ))
        })?;

        let file = OpenOptions::new().append(true).create(true).open(path).await?;

        let mut writer = Self {
            file,
            _lock: lock_handle,
            started_at: Instant::now(),
            header_written: false,
        };
        writer.write_header(&header).await?;
        Ok(writer)
    }

    async fn write_header(&mut self, header: &AsciinemaHeader) -> std::io::Result<()> {
        let mut line = serde_json::to_string(header)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.header_written = true;
        Ok(())
    }

    /// Seconds elapsed since this writer was created.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    async fn append_event(&mut self, event: &AsciinemaEvent) -> std::io::Result<()> {
        debug_assert!(self.header_written, "header must precede every event");
        let mut line = serde_json::to_string(&event.to_json())?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Append an `"o"` event with the current elapsed time. Bytes are
    /// coerced to UTF-8 lossily, matching asciinema's text-line format.
    pub async fn write_output(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let elapsed = self.elapsed_secs();
        let data = String::from_utf8_lossy(bytes).into_owned();
        self.append_event(&AsciinemaEvent::Output { elapsed, data })
            .await
    }

    /// Append an `"i"` event with the current elapsed time.
    pub async fn write_input(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let elapsed = self.elapsed_secs();
        let data = String::from_utf8_lossy(bytes).into_owned();
        self.append_event(&AsciinemaEvent::Input { elapsed, data })
            .await
    }

    /// Append an `"r"` event with the current elapsed time.
    pub async fn write_resize(&mut self, cols: u32, rows: u32) -> std::io::Result<()> {
        let elapsed = self.elapsed_secs();
        self.append_event(&AsciinemaEvent::Resize {
            elapsed,
            cols,
            rows,
        })
        .await
    }

    /// Append the `["exit", code, id]` terminator. Consumes the writer:
    /// no further writes are valid for a stream once it has exited.
    pub async fn write_exit(mut self, code: i32, session_id: &str) -> std::io::Result<()> {
        let line = serde_json::to_string(&Value::Array(vec![
            Value::String("exit".to_owned()),
            Value::Number(code.into()),
            Value::String(session_id.to_owned()),
        ]))?;
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_round_trips_through_json() {
        let header = AsciinemaHeader::new(80, 24);
        let line = serde_json::to_string(&header).unwrap();
        let parsed = parse_header(&line).unwrap();
        assert_eq!(parsed.width, 80);
        assert_eq!(parsed.height, 24);
    }

    #[test]
    fn output_event_round_trips() {
        let event = AsciinemaEvent::Output {
            elapsed: 1.25,
            data: "hello".to_owned(),
        };
        let line = serde_json::to_string(&event.to_json()).unwrap();
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed, StreamLine::Event(event));
    }

    #[test]
    fn resize_event_payload_format() {
        let event = AsciinemaEvent::Resize {
            elapsed: 0.0,
            cols: 120,
            rows: 40,
        };
        let json = event.to_json();
        assert_eq!(json[2], Value::String("120x40".to_owned()));
    }

    #[test]
    fn exit_terminator_round_trips() {
        let line = serde_json::to_string(&Value::Array(vec![
            Value::String("exit".to_owned()),
            Value::Number(0.into()),
            Value::String("abc".to_owned()),
        ]))
        .unwrap();
        let parsed = parse_line(&line).unwrap();
        assert_eq!(
            parsed,
            StreamLine::Exit {
                code: 0,
                session_id: "abc".to_owned()
            }
        );
    }

    #[test]
    fn malformed_line_is_rejected_not_panicking() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line("[1, \"x\", \"y\"]").is_err());
        assert!(parse_line("[1, \"r\", \"not-a-size\"]").is_err());
    }

    #[test]
    fn resize_payload_parses_cols_x_rows() {
        assert_eq!(parse_resize_payload("120x40"), Some((120, 40)));
        assert_eq!(parse_resize_payload("bogus"), None);
    }

    proptest::proptest! {
        /// Any output/input event round-trips through `to_json` ->
        /// serialize -> `parse_line` with its elapsed time and data intact.
        #[test]
        fn output_event_round_trips_arbitrary_elapsed_and_data(
            elapsed in 0.0_f64..1_000_000.0,
            data in proptest::collection::vec(proptest::prelude::any::<char>(), 0..64).prop_map(|cs| cs.into_iter().collect::<String>()),
        ) {
            let event = AsciinemaEvent::Output { elapsed, data: data.clone() };
            let line = serde_json::to_string(&event.to_json()).unwrap();
            let parsed = parse_line(&line).unwrap();
            let StreamLine::Event(AsciinemaEvent::Output { elapsed: got_elapsed, data: got_data }) = parsed else {
                panic!("expected an Output event, got {parsed:?}");
            };
            prop_assert!((got_elapsed - elapsed).abs() < f64::EPSILON);
            prop_assert_eq!(got_data, data);
        }

        /// Any resize event round-trips with its columns/rows intact.
        #[test]
        fn resize_event_round_trips(cols in 1_u32..1000, rows in 1_u32..1000) {
            let event = AsciinemaEvent::Resize { elapsed: 0.0, cols, rows };
            let line = serde_json::to_string(&event.to_json()).unwrap();
            let parsed = parse_line(&line).unwrap();
            let StreamLine::Event(AsciinemaEvent::Resize { cols: got_cols, rows: got_rows, .. }) = parsed else {
                panic!("expected a Resize event, got {parsed:?}");
            };
            prop_assert_eq!(got_cols, cols);
            prop_assert_eq!(got_rows, rows);
        }
    }
}
