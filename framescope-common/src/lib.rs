//! # Shared Wire Protocol (Client ↔ Viewer)
//!
//! Defines the messages exchanged between an instrumented application and a
//! viewer process, and the framing used to put them on a byte stream.
//!
//! ## Framing
//!
//! Every message is one frame: a 4-byte big-endian payload length followed by
//! a JSON document. Frames larger than [`MAX_FRAME_LEN`] are rejected on both
//! sides.
//!
//! ## Message Flow
//!
//! 1. Client sends [`ClientMessage::Hello`]
//! 2. Server answers [`ServerMessage::Hello`] or [`ServerMessage::Reject`]
//! 3. Client streams definition frames (`CollectorDef`, `ThreadDef`) and
//!    `Data` frames; a definition always precedes the first data frame that
//!    references its index
//! 4. Server may send [`ServerMessage::SetActive`] at any time
//! 5. Client sends [`ClientMessage::Goodbye`] on orderly disconnect
//!
//! ## Key Types
//!
//! - [`ClientMessage`] / [`ServerMessage`] - the two directions of the protocol
//! - [`DataFrame`] - one tick's worth of samples from one thread
//! - [`write_frame`] / [`read_frame`] - the length-prefixed codec

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Major protocol version. Servers reject clients with a different major.
pub const PROTOCOL_MAJOR: u16 = 1;

/// Minor protocol version. Informational; additive changes only.
pub const PROTOCOL_MINOR: u16 = 2;

/// Port a viewer listens on when none is configured.
pub const DEFAULT_PORT: u16 = 5185;

/// Upper bound on a single frame's payload, in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Sync group assigned to threads that never name one.
pub const DEFAULT_SYNC_GROUP: &str = "Default";

// ============================================================================
// Client → Server
// ============================================================================

/// Handshake sent by the client as the very first frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub major: u16,
    pub minor: u16,
    /// Program identifier (usually the executable name)
    pub program: String,
    /// Machine identifier (host name)
    pub machine: String,
    pub pid: u32,
}

impl Hello {
    /// Build a hello carrying this crate's protocol version.
    pub fn new(program: impl Into<String>, machine: impl Into<String>, pid: u32) -> Self {
        Self {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            program: program.into(),
            machine: machine.into(),
            pid,
        }
    }
}

/// Whether a collector accumulates elapsed time or a level value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    #[default]
    Time,
    Level,
}

/// Registry-definition frame for one collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorDefinition {
    pub index: u32,
    /// Fully qualified name, segments separated by `:`
    pub name: String,
    /// Parent collector index, `None` for roots
    pub parent: Option<u32>,
    pub kind: CollectorKind,
    /// Suggested RGB colour, each channel in `0.0..=1.0`
    pub color: Option<[f32; 3]>,
    pub sort: i32,
}

/// Registry-definition frame for one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDefinition {
    pub index: u32,
    pub name: String,
    pub sync_name: String,
    /// Pipeline stage at the time the thread was registered
    pub stage: u32,
}

/// Elapsed time accumulated by one collector during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorTime {
    pub collector: u32,
    pub elapsed_ns: u64,
}

/// Level value of one collector at the end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectorLevel {
    pub collector: u32,
    pub value: f64,
}

/// Start or stop marker within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Stop,
}

/// Timestamped start/stop marker, used by timeline views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEvent {
    pub collector: u32,
    pub kind: EventKind,
    pub timestamp_ns: u64,
}

/// One thread's samples for one tick.
///
/// Timestamps are nanoseconds on the client's session clock, which is shared
/// by all threads of the client and has pauses excised from it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataFrame {
    pub thread: u32,
    /// Pipeline stage the thread was at when the tick was taken
    pub stage: u32,
    pub frame_number: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub times: Vec<CollectorTime>,
    pub levels: Vec<CollectorLevel>,
    pub events: Vec<TimeEvent>,
}

impl DataFrame {
    /// Elapsed time reported for `collector`, if it ran during this tick.
    pub fn elapsed_ns(&self, collector: u32) -> Option<u64> {
        self.times.iter().find(|t| t.collector == collector).map(|t| t.elapsed_ns)
    }

    /// Level reported for `collector`, if one was recorded.
    pub fn level(&self, collector: u32) -> Option<f64> {
        self.levels.iter().find(|l| l.collector == collector).map(|l| l.value)
    }
}

/// Everything a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello(Hello),
    CollectorDef(CollectorDefinition),
    ThreadDef(ThreadDefinition),
    Data(DataFrame),
    Goodbye,
}

// ============================================================================
// Server → Client
// ============================================================================

/// Handshake accept sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub major: u16,
    pub minor: u16,
    pub server: String,
}

/// Everything a server may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello(ServerHello),
    Reject { reason: String },
    /// Enable or disable recording of a collector on the client
    SetActive { collector: u32, active: bool },
}

// ============================================================================
// Frame Codec
// ============================================================================

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("Stream ended in the middle of a frame")]
    Truncated,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// True when the error came from the socket rather than the payload.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Truncated)
    }
}

/// Serialize `msg` and write it as one length-prefixed frame.
pub fn write_frame<W: Write, M: Serialize>(writer: &mut W, msg: &M) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and deserialize it.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub fn read_frame<R: Read, M: DeserializeOwned>(reader: &mut R) -> Result<Option<M>, CodecError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(CodecError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(e)
        }
    })?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
