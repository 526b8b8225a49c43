//! Length-prefixed typed message codec (§4.A, §6).
//!
//! Frame format: `type(u8) | length(u32 big-endian) | payload(length bytes)`.
//! The encoder is pure; the decoder accumulates bytes across reads and
//! yields `(MessageType, Bytes)` pairs only once a full frame has arrived.
//! Oversize payloads are rejected with [`ProtocolError::PayloadTooLarge`]
//! and the caller is expected to close the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::ProtocolError;

/// Default cap on a single frame's payload size (§4.A).
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Default heartbeat interval (§4.A).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Number of missed heartbeats before a peer is considered dead (§4.A).
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// The closed set of control-message types (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// CLI/app asks the daemon for its current status.
    StatusRequest = 0x01,
    /// Daemon's reply to `StatusRequest`.
    StatusResponse = 0x02,
    /// Request to enable/disable Git follow-mode for a repo.
    GitFollowRequest = 0x03,
    /// Reply to `GitFollowRequest`.
    GitFollowResponse = 0x04,
    /// Notification that a Git event occurred in a followed repo.
    GitEventNotify = 0x05,
    /// Acknowledgement of a `GitEventNotify`.
    GitEventAck = 0x06,
    /// Idle-timer keepalive; empty payload.
    Heartbeat = 0x07,
    /// Raw bytes to forward to a session's PTY stdin.
    Stdin = 0x08,
    /// Resize request for a session's PTY.
    Resize = 0x09,
    /// Unsolicited status push (e.g. Claude working-status change).
    StatusUpdate = 0x0A,
    /// Protocol or request error.
    Error = 0x0B,
}

impl MessageType {
    /// Decode a message type from its wire byte.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownType`] if `byte` is not one of the
    /// closed set of message types.
    pub const fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::StatusRequest),
            0x02 => Ok(Self::StatusResponse),
            0x03 => Ok(Self::GitFollowRequest),
            0x04 => Ok(Self::GitFollowResponse),
            0x05 => Ok(Self::GitEventNotify),
            0x06 => Ok(Self::GitEventAck),
            0x07 => Ok(Self::Heartbeat),
            0x08 => Ok(Self::Stdin),
            0x09 => Ok(Self::Resize),
            0x0A => Ok(Self::StatusUpdate),
            0x0B => Ok(Self::Error),
            other => Err(ProtocolError::UnknownType { byte: other }),
        }
    }

    /// True for message types whose payload is JSON (every type but
    /// [`Self::Stdin`] and [`Self::Heartbeat`], per §3).
    #[must_use]
    pub const fn is_json(self) -> bool {
        !matches!(self, Self::Stdin | Self::Heartbeat)
    }
}

/// A single decoded frame: its type plus raw payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame's message type.
    pub message_type: MessageType,
    /// Raw payload bytes (JSON for control types, raw bytes for stdin,
    /// empty for heartbeat).
    pub payload: Bytes,
}

/// Pure encode: `encode(type, payload) -> bytes`.
#[must_use]
pub fn encode(message_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(message_type as u8);
    #[expect(clippy::cast_possible_truncation, reason = "caller enforces DEFAULT_MAX_PAYLOAD")]
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a JSON-serializable control message.
///
/// # Errors
///
/// Returns a JSON serialization error.
pub fn encode_json<T: serde::Serialize>(
    message_type: MessageType,
    value: &T,
) -> Result<Bytes, serde_json::Error> {
    let payload = serde_json::to_vec(value)?;
    Ok(encode(message_type, &payload))
}

/// Stream-based frame decoder for use with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: u32,
    // Length of the currently in-progress frame's payload, once the header
    // has been fully read.
    pending_len: Option<u32>,
}

impl FrameCodec {
    /// Create a codec with the default payload cap (§4.A).
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a codec with a custom payload cap.
    #[must_use]
    pub const fn with_max_payload(max_payload: u32) -> Self {
        Self {
            max_payload,
            pending_len: None,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

const HEADER_LEN: usize = 5;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
                if len > self.max_payload {
                    return Err(ProtocolError::PayloadTooLarge {
                        length: len,
                        cap: self.max_payload,
                    });
                }
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < HEADER_LEN + len as usize {
            src.reserve(HEADER_LEN + len as usize - src.len());
            return Ok(None);
        }

        let type_byte = src[0];
        let message_type = MessageType::from_byte(type_byte)?;
        src.advance(HEADER_LEN);
        let payload = src.split_to(len as usize).freeze();
        self.pending_len = None;

        Ok(Some(Frame {
            message_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.payload.len() as u64 > u64::from(self.max_payload) {
            return Err(ProtocolError::PayloadTooLarge {
                length: item.payload.len() as u32,
                cap: self.max_payload,
            });
        }
        dst.extend_from_slice(&encode(item.message_type, &item.payload));
        Ok(())
    }
}

/// Tracks heartbeat misses for one peer connection (§4.A).
///
/// The caller resets the monitor on every received frame (heartbeats count
/// as activity, as does any other message) and polls [`Self::is_dead`] on
/// its own idle timer tick.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    misses: u32,
    limit: u32,
}

impl HeartbeatMonitor {
    /// Create a monitor with the default miss limit (§4.A).
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(HEARTBEAT_MISS_LIMIT)
    }

    /// Create a monitor with a custom miss limit.
    #[must_use]
    pub const fn with_limit(limit: u32) -> Self {
        Self { misses: 0, limit }
    }

    /// Record that an idle-timer interval elapsed with no traffic.
    pub fn tick_without_activity(&mut self) {
        self.misses = self.misses.saturating_add(1);
    }

    /// Reset the miss counter after observing any traffic from the peer.
    pub fn record_activity(&mut self) {
        self.misses = 0;
    }

    /// True once consecutive idle ticks reach the miss limit.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.misses >= self.limit
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn round_trips_a_single_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame {
                    message_type: MessageType::Heartbeat,
                    payload: Bytes::new(),
                },
                &mut buf,
            )
            .unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message_type, MessageType::Heartbeat);
        assert!(frame.payload.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decodes_incrementally_as_bytes_trickle_in() {
        let encoded = encode(MessageType::Stdin, b"hello");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut produced = None;

        for byte in &encoded {
            buf.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                produced = Some(frame);
            }
        }

        let frame = produced.expect("frame should be complete once all bytes arrive");
        assert_eq!(frame.message_type, MessageType::Stdin);
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn rejects_oversize_payload() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Stdin as u8);
        buf.put_u32(100);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u32(0);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType { byte: 0xFF }));
    }

    #[test]
    fn heartbeat_monitor_marks_peer_dead_after_limit() {
        let mut monitor = HeartbeatMonitor::with_limit(3);
        assert!(!monitor.is_dead());
        monitor.tick_without_activity();
        monitor.tick_without_activity();
        assert!(!monitor.is_dead());
        monitor.tick_without_activity();
        assert!(monitor.is_dead());
        monitor.record_activity();
        assert!(!monitor.is_dead());
    }

    proptest::proptest! {
        /// Any payload under the default cap round-trips through a single
        /// `decode` call regardless of how it was chunked on the wire.
        #[test]
        fn stdin_payload_round_trips_whatever_the_chunking(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096),
            chunk_size in 1_usize..128,
        ) {
            let encoded = encode(MessageType::Stdin, &payload);
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut produced = None;

            for chunk in encoded.chunks(chunk_size) {
                buf.put_slice(chunk);
                if let Some(frame) = codec.decode(&mut buf).unwrap() {
                    produced = Some(frame);
                }
            }

            let frame = produced.expect("frame completes once all bytes arrive");
            prop_assert_eq!(frame.message_type, MessageType::Stdin);
            prop_assert_eq!(frame.payload.as_ref(), payload.as_slice());
            prop_assert!(buf.is_empty());
        }

        /// Every defined message type byte round-trips through `from_byte`.
        #[test]
        fn known_type_bytes_never_error(byte in 0x01_u8..=0x0B_u8) {
            prop_assert!(MessageType::from_byte(byte).is_ok());
        }
    }
}
