//! Frame encoding for WebSocket transports.
//!
//! Browser clients speak JSON text frames; native clients may use compact
//! bincode binary frames. Both decode into the same message enums.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest frame either side will encode or accept.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn format(&self) -> WireFormat {
        match self {
            Frame::Text(_) => WireFormat::Json,
            Frame::Binary(_) => WireFormat::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary codec error: {0}")]
    Binary(#[from] bincode::Error),
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    TooLarge { len: usize, limit: usize },
}

fn binary_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_BYTES as u64)
}

pub fn encode<T: Serialize>(value: &T, format: WireFormat) -> Result<Frame, CodecError> {
    let frame = match format {
        WireFormat::Json => Frame::Text(serde_json::to_string(value)?),
        WireFormat::Binary => Frame::Binary(binary_options().serialize(value)?),
    };
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge {
            len: frame.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, CodecError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge {
            len: frame.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    match frame {
        Frame::Text(text) => Ok(serde_json::from_str(text)?),
        Frame::Binary(bytes) => Ok(binary_options().deserialize(bytes)?),
    }
}

pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(binary_options().serialize(value)?)
}

pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(binary_options().deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientPacket, PlayerInput, ServerPacket};

    #[test]
    fn test_frame_format_follows_encoding() {
        let packet = ClientPacket::Ping { client_time: 12.5 };
        assert_eq!(encode(&packet, WireFormat::Json).unwrap().format(), WireFormat::Json);
        assert_eq!(
            encode(&packet, WireFormat::Binary).unwrap().format(),
            WireFormat::Binary
        );
    }

    #[test]
    fn test_binary_frame_is_smaller_than_json() {
        let packet = ClientPacket::PlayerInput(PlayerInput {
            seq: 99,
            forward: 1.0,
            right: -0.5,
            run: true,
            yaw: 1.25,
            timestamp: 1_700_000_000_000.0,
            ..PlayerInput::default()
        });
        let json = encode(&packet, WireFormat::Json).unwrap();
        let binary = encode(&packet, WireFormat::Binary).unwrap();
        assert!(binary.len() < json.len());
        let decoded: ClientPacket = decode(&binary).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let garbage = Frame::Binary(vec![0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decode::<ClientPacket>(&garbage),
            Err(CodecError::Binary(_))
        ));

        let bad_json = Frame::Text("{not json".to_string());
        assert!(matches!(
            decode::<ServerPacket>(&bad_json),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_before_parsing() {
        let huge = Frame::Text("a".repeat(MAX_FRAME_BYTES + 1));
        assert!(matches!(
            decode::<ClientPacket>(&huge),
            Err(CodecError::TooLarge { .. })
        ));
    }
}
