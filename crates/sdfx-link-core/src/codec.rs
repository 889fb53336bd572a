//! Frame codec: classify and decode inbound frames, encode outbound envelopes.
//!
//! Pure functions. Decoding never fails loudly; anything that cannot be
//! classified comes back as [`InboundMessage::Malformed`].

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::{
    ControlEnvelope, Frame, ImageFormat, PreviewImage, PREVIEW_FRAME_KIND, PREVIEW_HEADER_LEN,
};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Text frame carrying a control envelope.
    Control {
        kind: String,
        segment: Option<String>,
        payload: serde_json::Value,
    },
    /// Binary preview image frame.
    BinaryPreview(PreviewImage),
    /// A frame that could not be classified. Never dispatched.
    Malformed { raw: Frame, error: CodecError },
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid control envelope: {0}")]
    InvalidEnvelope(String),

    #[error("binary frame truncated ({len} bytes, need {need})")]
    Truncated { len: usize, need: usize },

    #[error("unknown binary frame kind {0}")]
    UnknownBinaryKind(u32),
}

/// Decode a frame as delivered by the transport.
pub fn decode(frame: Frame) -> InboundMessage {
    match frame {
        Frame::Text(text) => decode_text(&text),
        Frame::Binary(bytes) => decode_binary(bytes),
    }
}

/// Decode a text frame. The document must be an object with a string `type`.
pub fn decode_text(text: &str) -> InboundMessage {
    match serde_json::from_str::<ControlEnvelope>(text) {
        Ok(envelope) => InboundMessage::Control {
            kind: envelope.kind,
            segment: envelope.segment,
            payload: envelope.data.unwrap_or(serde_json::Value::Null),
        },
        Err(e) => InboundMessage::Malformed {
            raw: Frame::Text(text.to_string()),
            error: CodecError::InvalidEnvelope(e.to_string()),
        },
    }
}

/// Decode a binary frame: `[u32 BE kind][u32 BE format][image bytes]`.
pub fn decode_binary(bytes: Bytes) -> InboundMessage {
    let Some(kind) = read_u32(&bytes, 0) else {
        let error = CodecError::Truncated {
            len: bytes.len(),
            need: 4,
        };
        return InboundMessage::Malformed {
            raw: Frame::Binary(bytes),
            error,
        };
    };

    if kind != PREVIEW_FRAME_KIND {
        return InboundMessage::Malformed {
            raw: Frame::Binary(bytes),
            error: CodecError::UnknownBinaryKind(kind),
        };
    }

    let Some(selector) = read_u32(&bytes, 4) else {
        let error = CodecError::Truncated {
            len: bytes.len(),
            need: PREVIEW_HEADER_LEN,
        };
        return InboundMessage::Malformed {
            raw: Frame::Binary(bytes),
            error,
        };
    };

    InboundMessage::BinaryPreview(PreviewImage {
        format: ImageFormat::from_selector(selector),
        bytes: bytes.slice(PREVIEW_HEADER_LEN..),
    })
}

/// Serialize an outbound control envelope into a text frame body.
pub fn encode(envelope: &ControlEnvelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}
