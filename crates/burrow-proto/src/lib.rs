//! Wire protocol definitions for the burrow tunnel server
//!
//! Defines the versioned frame envelope multiplexing many logical streams
//! over one agent connection, plus the payload records exchanged during the
//! authentication handshake.

pub mod frame;
pub mod messages;

pub use frame::{read_frame, write_frame, Frame, FrameError, FrameFlags, FrameType, StreamId};
pub use messages::{AuthRequest, AuthResponse};

/// Protocol version carried in every frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for control frames
pub const CONTROL_STREAM_ID: StreamId = 0;
