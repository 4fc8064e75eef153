//! Data channel frames
//!
//! One agent data connection carries every tunneled TCP stream for its
//! endpoint. Each frame addresses one stream: `Open` announces a new stream
//! picked by the control plane, `Data` moves payload in either direction,
//! `Close` tears one stream down without touching the rest.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Identifier of one tunneled stream inside a data channel.
pub type StreamId = u32;

/// Frame kinds carried on a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// One multiplexed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header layout: stream_id (4) + frame_type (1) + flags (1) + length (4).
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode the frame to bytes.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode a frame from bytes.
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::Truncated);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }
        if buf.remaining() < length as usize {
            return Err(FrameError::Truncated);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        })
    }
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("truncated frame")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("GET /info HTTP/1.1\r\n\r\n");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_frame_with_flags() {
        let frame = Frame::close(10).with_flags(FrameFlags::new().with_fin());

        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
        assert!(decoded.flags.has_fin());
        assert!(!decoded.flags.has_rst());
        assert_eq!(decoded.frame_type, FrameType::Close);
    }

    #[test]
    fn test_decode_truncated() {
        let frame = Frame::data(1, Bytes::from("payload"));
        let mut encoded = frame.encode().unwrap();
        let short = encoded.split_to(Frame::HEADER_SIZE + 2);

        assert!(matches!(Frame::decode(short), Err(FrameError::Truncated)));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        buf.put_u8(0);
        buf.put_u32(0);

        assert!(matches!(
            Frame::decode(buf.freeze()),
            Err(FrameError::InvalidFrameType(9))
        ));
    }
}
