//! Connection and stream error kinds

use burrow_proto::{FrameError, FrameType, StreamId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("max connections reached")]
    MaxConnections,

    #[error("connection already exists")]
    ConnectionExists,

    #[error("connection not found")]
    ConnectionNotFound,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection closed by agent")]
    ConnectionClosedByAgent,

    #[error("stream already exists: {0}")]
    StreamExists(StreamId),

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("stream closed: {0}")]
    StreamClosed(StreamId),

    #[error("invalid control frame type: {0:?}")]
    InvalidControlFrame(FrameType),

    #[error("invalid stream frame type: {0:?}")]
    InvalidStreamFrame(FrameType),

    #[error(transparent)]
    Frame(#[from] FrameError),
}
