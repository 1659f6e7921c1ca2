//! Text framing for bus payloads.
//!
//! A frame is `"<name>;<base64(content)>"`. The standard base64 alphabet has
//! no `;`, so decoding splits on the first delimiter only. The codec never
//! looks inside `content`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio_util::bytes::Bytes;

pub const DELIMITER: char = ';';

/// Why a frame could not be decoded (or an envelope could not be built).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no '{DELIMITER}' delimiter")]
    MissingDelimiter,
    #[error("frame content is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("frame is not valid UTF-8 text")]
    NotText,
    #[error("name '{0}' contains the frame delimiter")]
    DelimiterInName(String),
}

/// A named blob: either a request or a reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    name: String,
    content: Bytes,
}

impl Envelope {
    /// Build an envelope, rejecting names that would break framing.
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Result<Self, FrameError> {
        let name = name.into();
        if name.contains(DELIMITER) {
            return Err(FrameError::DelimiterInName(name));
        }
        Ok(Self {
            name,
            content: content.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.name, self.content)
    }

    pub fn encode(&self) -> String {
        encode(&self.name, &self.content)
    }

    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        let (name, content) = decode(frame)?;
        Ok(Self { name, content })
    }

    /// Decode a raw bus payload, which must be UTF-8 text.
    pub fn decode_bytes(payload: &[u8]) -> Result<Self, FrameError> {
        let frame = std::str::from_utf8(payload).map_err(|_| FrameError::NotText)?;
        Self::decode(frame)
    }
}

/// Encode `name` and `content` into one frame.
///
/// `name` must not contain [`DELIMITER`]; [`Envelope::new`] enforces that.
pub fn encode(name: &str, content: &[u8]) -> String {
    let mut frame = String::with_capacity(name.len() + 1 + content.len().div_ceil(3) * 4);
    frame.push_str(name);
    frame.push(DELIMITER);
    STANDARD.encode_string(content, &mut frame);
    frame
}

pub fn decode(frame: &str) -> Result<(String, Bytes), FrameError> {
    let (name, encoded) = frame
        .split_once(DELIMITER)
        .ok_or(FrameError::MissingDelimiter)?;
    let content = STANDARD.decode(encoded)?;
    tracing::trace!(name, content_bytes = content.len(), "Decoded frame");
    Ok((name.to_string(), Bytes::from(content)))
}
