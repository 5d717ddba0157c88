//! Multiplexing frames carried over a promoted control connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new stream; the payload is empty
    Open = 0,
    Data = 1,
    /// FIN half-closes the sender's direction, RST aborts the stream
    Close = 2,
    /// Session is going away; no new streams will be accepted
    GoAway = 3,
    /// Grants the peer more send credit; the payload is a u32 byte count
    WindowUpdate = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxFrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::GoAway),
            4 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxFrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0100;

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

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
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

    /// Graceful half-close of the sender's direction
    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    /// Abort the stream in both directions
    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(stream_id, FrameType::WindowUpdate, payload.freeze())
    }

    /// Credit carried by a WindowUpdate frame
    pub fn window_increment(&self) -> Result<u32, MuxFrameError> {
        match self.payload.as_ref() {
            [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
            other => Err(MuxFrameError::InvalidWindowUpdate(other.len())),
        }
    }

    pub fn go_away() -> Self {
        Self::new(0, FrameType::GoAway, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxFrameError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MuxFrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxFrameError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Decode one frame from the front of a read buffer
    ///
    /// Returns Ok(None) until a whole frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, MuxFrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxFrameError::FrameTooLarge(length as usize));
        }

        if buf.len() < Self::HEADER_SIZE + length as usize {
            buf.reserve(Self::HEADER_SIZE + length as usize - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

/// Frame-level multiplexer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxFrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid window update payload: {0} bytes")]
    InvalidWindowUpdate(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let mut buf = BytesMut::from(&frame.encode().unwrap()[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_close_flags() {
        let fin = Frame::fin(10);
        assert!(fin.flags.has_fin());
        assert!(!fin.flags.has_rst());

        let mut buf = BytesMut::new();
        Frame::reset(11).encode_into(&mut buf).unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::Close);
        assert!(decoded.flags.has_rst());
    }

    #[test]
    fn test_decode_partial() {
        let encoded = Frame::data(3, Bytes::from_static(b"abcdef")).encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..Frame::HEADER_SIZE + 2]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[Frame::HEADER_SIZE + 2..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcdef");
    }

    #[test]
    fn test_window_update() {
        let mut buf = BytesMut::new();
        Frame::window_update(5, 65536).encode_into(&mut buf).unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.window_increment().unwrap(), 65536);

        let bad = Frame::new(5, FrameType::WindowUpdate, Bytes::from_static(b"ab"));
        assert_eq!(
            bad.window_increment().unwrap_err(),
            MuxFrameError::InvalidWindowUpdate(2)
        );
    }

    #[test]
    fn test_decode_invalid_type() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 9, 0, 0, 0, 0, 0][..]);
        assert_eq!(
            Frame::decode(&mut buf).unwrap_err(),
            MuxFrameError::InvalidFrameType(9)
        );
    }

    #[test]
    fn test_decode_oversized() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u8(0);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(MuxFrameError::FrameTooLarge(_))
        ));
    }
}
