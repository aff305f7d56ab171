//! Frame envelope for multiplexed agent connections

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stream identifier
pub type StreamId = u32;

/// Frame types carried over an agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Auth = 0,
    Heartbeat = 1,
    Close = 2,
    OpenStream = 3,
    Data = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Auth),
            1 => Ok(FrameType::Heartbeat),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::OpenStream),
            4 => Ok(FrameType::Data),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const NONE: u8 = 0;
    pub const END_STREAM: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_end_stream(mut self) -> Self {
        self.0 |= Self::END_STREAM;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn has_end_stream(&self) -> bool {
        self.0 & Self::END_STREAM != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single protocol frame
///
/// Stream id 0 is reserved for control frames (auth, heartbeat, connection
/// close); ids above 0 carry multiplexed request/response streams.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: version (1) + type (1) + flags (1) + stream_id (4) + length (4)
    pub const HEADER_SIZE: usize = 11;

    pub fn new(frame_type: FrameType, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            frame_type,
            flags: FrameFlags::new(),
            stream_id,
            payload,
        }
    }

    /// Control frame on the reserved stream
    pub fn control(frame_type: FrameType, payload: Bytes) -> Self {
        Self::new(frame_type, crate::CONTROL_STREAM_ID, payload)
    }

    pub fn heartbeat() -> Self {
        Self::control(FrameType::Heartbeat, Bytes::new())
    }

    pub fn open_stream(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameType::OpenStream, stream_id, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_control(&self) -> bool {
        self.stream_id == crate::CONTROL_STREAM_ID
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.has_end_stream()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u8(self.version);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(self.stream_id);
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode one frame from a buffer
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::IncompleteFrame);
        }

        let version = buf.get_u8();
        if version != crate::PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let stream_id = buf.get_u32();
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(FrameError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            version,
            frame_type,
            flags,
            stream_id,
            payload,
        })
    }
}

/// Read one frame from an async reader
///
/// The caller bounds the read with its own deadline; a clean EOF before the
/// first header byte surfaces as an IO error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; Frame::HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let version = header[0];
    if version != crate::PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let frame_type = FrameType::try_from(header[1])?;
    let flags = FrameFlags::from_u8(header[2]);
    let stream_id = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
    let length = u32::from_be_bytes([header[7], header[8], header[9], header[10]]);

    if length > crate::MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length as usize));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        version,
        frame_type,
        flags,
        stream_id,
        payload: Bytes::from(payload),
    })
}

/// Write one frame to an async writer and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("incomplete frame")]
    IncompleteFrame,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
