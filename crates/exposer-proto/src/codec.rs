//! Codec for handshake frames
//!
//! Frames are written back-to-back as independent JSON documents with no
//! length prefix. Decoding consumes exactly one document from the front of
//! the buffer and leaves every byte after it untouched, so whatever follows
//! the last handshake (multiplexer frames, forwarded bytes) can be handed to
//! the next consumer of the connection.

use crate::messages::{Handshake, OutgoingHandshake};
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Handshake too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Handshake frame codec
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Encode one handshake frame
    pub fn encode<T: Serialize + ?Sized>(command: &str, details: &T) -> Result<Bytes, CodecError> {
        let data = serde_json::to_vec(&OutgoingHandshake { command, details })?;

        if data.len() > crate::MAX_HANDSHAKE_SIZE {
            return Err(CodecError::MessageTooLarge(data.len()));
        }

        Ok(Bytes::from(data))
    }

    /// Build the frame a peer would decode for `command`/`details`
    ///
    /// Used for synthetic events so they carry exactly what a wire frame would.
    pub fn to_handshake<T: Serialize + ?Sized>(
        command: &str,
        details: &T,
    ) -> Result<Handshake, CodecError> {
        let data = Self::encode(command, details)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Decode one handshake frame from the front of the buffer
    ///
    /// Returns Ok(Some(frame)) if a complete document was decoded,
    /// Ok(None) if more data is needed,
    /// Err on malformed input
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Handshake>, CodecError> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Handshake>();

        match stream.next() {
            None => {
                // Whitespace only
                Ok(None)
            }
            Some(Ok(frame)) => {
                let consumed = stream.byte_offset();
                buf.advance(consumed);
                Ok(Some(frame))
            }
            Some(Err(e)) if e.is_eof() => {
                if buf.len() > crate::MAX_HANDSHAKE_SIZE {
                    return Err(CodecError::MessageTooLarge(buf.len()));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(CodecError::SerializationError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AuthRequest, CMD_AUTH, CMD_PING};

    #[test]
    fn test_encode_wire_format() {
        let encoded = HandshakeCodec::encode(
            CMD_AUTH,
            &AuthRequest {
                key: "secret".to_string(),
            },
        )
        .unwrap();

        assert_eq!(
            &encoded[..],
            br#"{"cmd":"auth","details":{"Key":"secret"}}"#
        );
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = HandshakeCodec::encode(CMD_PING, &()).unwrap();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert_eq!(HandshakeCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[5..]);
        let frame = HandshakeCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, CMD_PING);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_keeps_remainder() {
        let encoded = HandshakeCodec::encode(CMD_PING, &()).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded);
        buf.extend_from_slice(b"\x00\x00\x00\x01raw bytes");

        let frame = HandshakeCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, CMD_PING);
        assert_eq!(&buf[..], b"\x00\x00\x00\x01raw bytes");
    }

    #[test]
    fn test_decode_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"cmd":"ping","details":null}{"cmd":"pong"}"#);

        let first = HandshakeCodec::decode(&mut buf).unwrap().unwrap();
        let second = HandshakeCodec::decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.command, "ping");
        assert_eq!(second.command, "pong");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_malformed() {
        let mut buf = BytesMut::from(&b"not json"[..]);
        assert!(HandshakeCodec::decode(&mut buf).is_err());
    }

    #[test]
    fn test_to_handshake_matches_wire() {
        let frame = HandshakeCodec::to_handshake("event:timeout", &()).unwrap();
        assert_eq!(frame.command, "event:timeout");
        assert!(frame.details.is_null());
    }
}
