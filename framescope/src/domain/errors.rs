//! Structured error types for framescope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Only [`ConnectError`] ever reaches application code from the transport.
//! [`TransportError`] stays inside the link threads and is logged; [`RegistryError`]
//! reports misuse by the instrumented code.

use super::types::{CollectorIndex, ThreadIndex};
use framescope_common::CodecError;
use thiserror::Error;

/// Misuse of the collector or thread registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{index} is out of range ({count} collectors registered)")]
    UnknownCollector { index: CollectorIndex, count: usize },

    #[error("{index} is out of range ({count} threads registered)")]
    UnknownThread { index: ThreadIndex, count: usize },

    #[error("Invalid collector name {0:?}")]
    InvalidName(String),

    #[error("{collector} stopped on {thread} but was never started there")]
    NotStarted { collector: CollectorIndex, thread: ThreadIndex },

    #[error("{collector} stopped on {thread} while {top} is still running inside it")]
    OutOfOrderStop { collector: CollectorIndex, top: CollectorIndex, thread: ThreadIndex },

    #[error("Registry capacity exhausted")]
    Exhausted,
}

/// Handshake or framing violations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Protocol version mismatch: local {local}.x, remote {remote}.x")]
    VersionMismatch { local: u16, remote: u16 },

    #[error("Server rejected the connection: {0}")]
    Rejected(String),

    #[error("Expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("Peer closed the connection during the handshake")]
    ClosedDuringHandshake,

    #[error("Data frame references undefined {kind} index {index}")]
    UndefinedIndex { kind: &'static str, index: u32 },
}

/// Failures of an established session, seen by the link threads.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Viewer ended the session: {0}")]
    ConnectionLost(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Why [`crate::Client::try_connect`] failed.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Another connection attempt is in progress")]
    InProgress,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures on the viewer side of a connection.
#[derive(Error, Debug)]
pub enum ViewerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
