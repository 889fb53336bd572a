//! Backend realtime wire protocol.
//!
//! A single WebSocket carries two frame encodings:
//! - text frames holding a JSON control envelope `{type, segment?, data?}`
//! - binary frames `[u32 BE kind][u32 BE image format][image bytes...]`
//!
//! The same envelope shape is used in both directions; there is no separate
//! wire format for commands versus events.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Binary frame kind carrying a preview image.
pub const PREVIEW_FRAME_KIND: u32 = 1;

/// Image format selector for PNG previews. Every other selector is JPEG.
pub const PNG_FORMAT_SELECTOR: u32 = 2;

/// Offset of the image payload inside a preview frame.
pub const PREVIEW_HEADER_LEN: usize = 8;

/// Segment used for authentication and keepalive traffic.
pub const GLOBAL_SEGMENT: &str = "global";

/// One discrete message unit as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The control envelope carried by every text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ControlEnvelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            segment: None,
            data: None,
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Subscribe the connection to the global channel with a bearer token.
    pub fn auth(token: &str) -> Self {
        Self::new("auth")
            .with_segment(GLOBAL_SEGMENT)
            .with_data(serde_json::json!({ "token": token }))
    }

    /// Keepalive answer to a server `ping`.
    pub fn pong(segment: Option<&str>) -> Self {
        Self::new("pong").with_segment(segment.unwrap_or(GLOBAL_SEGMENT))
    }
}

/// Encoding of a preview image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Map the wire selector to a format. Unknown selectors fall back to JPEG.
    pub fn from_selector(selector: u32) -> Self {
        match selector {
            PNG_FORMAT_SELECTOR => Self::Png,
            _ => Self::Jpeg,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// A decoded preview image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub format: ImageFormat,
    pub bytes: Bytes,
}

/// Build a binary preview frame. Mostly useful for tests and mock backends.
pub fn preview_frame(format_selector: u32, image: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(PREVIEW_HEADER_LEN + image.len());
    buf.extend_from_slice(&PREVIEW_FRAME_KIND.to_be_bytes());
    buf.extend_from_slice(&format_selector.to_be_bytes());
    buf.extend_from_slice(image);
    Bytes::from(buf)
}
