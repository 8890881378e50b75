//! Fixed-layout wire frames.
//!
//! Frame format: `[kind:4][sender_name:256][payload:256][timestamp_ms:8]`
//!
//! - **kind**: protocol-specific message tag (little-endian u32)
//! - **sender_name**: UTF-8, NUL-padded to capacity
//! - **payload**: UTF-8, NUL-padded to capacity
//! - **timestamp_ms**: producer wall-clock time, ms since Unix epoch
//!   (little-endian u64)
//!
//! Every frame serializes to exactly [`FRAME_LEN`] bytes, so neither side
//! needs length framing: a socket read is complete when `FRAME_LEN` bytes
//! have arrived. Both peers must be compiled with the same capacities.

use std::sync::Weak;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::connection::Connection;

/// Capacity of the sender name field, in bytes.
pub const NAME_CAPACITY: usize = 256;

/// Capacity of the payload field, in bytes.
pub const PAYLOAD_CAPACITY: usize = 256;

/// Total serialized frame size: kind + name + payload + timestamp.
pub const FRAME_LEN: usize = 4 + NAME_CAPACITY + PAYLOAD_CAPACITY + 8;

const NAME_OFFSET: usize = 4;
const PAYLOAD_OFFSET: usize = NAME_OFFSET + NAME_CAPACITY;
const TIMESTAMP_OFFSET: usize = PAYLOAD_OFFSET + PAYLOAD_CAPACITY;

/// One wire message.
///
/// Text fields are truncated to their field capacity at the point of
/// population (on a `char` boundary), never at encode time, so what you
/// read back from a [`Frame`] is what the peer will receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol-specific message kind tag.
    pub kind: u32,
    sender_name: String,
    payload: String,
    /// Producer wall-clock time at send, ms since Unix epoch.
    pub timestamp_ms: u64,
}

impl Frame {
    /// Create an empty frame of the given kind, stamped with the current
    /// wall-clock time.
    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            sender_name: String::new(),
            payload: String::new(),
            timestamp_ms: now_ms(),
        }
    }

    /// Set the sender name, truncating to [`NAME_CAPACITY`] bytes.
    pub fn set_sender_name(&mut self, name: &str) {
        self.sender_name = truncate_to(name, NAME_CAPACITY).to_string();
    }

    /// Set the payload, truncating to [`PAYLOAD_CAPACITY`] bytes.
    pub fn set_payload(&mut self, payload: &str) {
        self.payload = truncate_to(payload, PAYLOAD_CAPACITY).to_string();
    }

    /// The sender name carried by this frame.
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    /// The payload carried by this frame.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        write_text(&mut buf[NAME_OFFSET..NAME_OFFSET + NAME_CAPACITY], &self.sender_name);
        write_text(
            &mut buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_CAPACITY],
            &self.payload,
        );
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf
    }

    /// Deserialize from the fixed wire layout.
    ///
    /// Decoding is total: any `FRAME_LEN` byte block yields a frame. Text
    /// fields stop at the first NUL or at capacity, whichever comes first,
    /// and invalid UTF-8 is replaced rather than rejected. Unknown kind
    /// tags are the application's concern.
    pub fn decode(buf: &[u8; FRAME_LEN]) -> Self {
        let kind = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let sender_name = read_text(&buf[NAME_OFFSET..NAME_OFFSET + NAME_CAPACITY]);
        let payload = read_text(&buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_CAPACITY]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);
        Self {
            kind,
            sender_name,
            payload,
            timestamp_ms: u64::from_le_bytes(ts),
        }
    }
}

/// A frame tagged with the connection it arrived on.
///
/// On a server the origin identifies which registered client produced the
/// message; on a client it is always `None` because there is exactly one
/// peer. The reference is weak: the server registry holds the only strong
/// references, so a message whose connection has since been removed simply
/// fails to upgrade and is discarded by the dispatcher.
#[derive(Debug, Clone)]
pub struct OwnedMessage {
    /// The connection the frame arrived on, if tagged.
    pub origin: Option<Weak<Connection>>,
    /// The decoded frame.
    pub message: Frame,
}

/// Current wall-clock time in ms since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Longest prefix of `s` that fits in `cap` bytes, cut on a char boundary.
fn truncate_to(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// NUL-pad `text` into `field`. Caller guarantees `text` fits.
fn write_text(field: &mut [u8], text: &str) {
    debug_assert!(text.len() <= field.len());
    field[..text.len()].copy_from_slice(text.as_bytes());
}

/// Read a NUL-terminated (or capacity-bounded) UTF-8 field.
fn read_text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
