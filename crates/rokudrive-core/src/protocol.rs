//! Binary wire protocol spoken with the on-device component.
//!
//! Every request and response travels as one length-prefixed frame over a raw
//! TCP socket.
//!
//! # Frame Structure (Little Endian)
//!
//! ```text
//! [u32 LE string_len] [u32 LE binary_len] [JSON envelope: string_len bytes] [raw bytes: binary_len bytes]
//! ```
//!
//! The JSON segment carries a request or response envelope. The binary segment
//! carries file contents and is empty for most operations.
//!
//! Encoding is a pure function ([`encode_frame`]). Decoding is a state machine
//! ([`FrameDecoder`]) because the socket hands over arbitrarily chunked byte
//! ranges.
//!
//! # Example
//!
//! ```
//! use rokudrive_core::protocol::{encode_frame, FrameDecoder};
//!
//! let wire = encode_frame(r#"{"id":"a1","success":true}"#, &[0xDE, 0xAD]);
//!
//! let mut decoder = FrameDecoder::new();
//! let mut frames = decoder.feed(&wire[..5]);
//! assert!(frames.is_empty());
//! frames = decoder.feed(&wire[5..]);
//! let frame = frames.remove(0).unwrap();
//! assert_eq!(frame.binary_payload, vec![0xDE, 0xAD]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::LogLevel;
use crate::request::Request;

/// Size of the fixed frame header: two little-endian `u32` lengths.
pub const HEADER_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding frames.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The JSON segment of a frame could not be parsed.
    #[error("malformed JSON segment: {0}")]
    MalformedJson(String),

    /// The JSON segment parsed but is not a valid envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// An envelope could not be serialized.
    #[error("failed to serialize envelope: {0}")]
    Serialize(String),

    /// A segment is larger than the 32-bit length field can describe.
    #[error("segment of {0} bytes exceeds the u32 length field")]
    SegmentTooLarge(usize),
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Per-request settings sent to the device alongside every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSettings {
    /// Log verbosity the device component should use while handling the request.
    pub log_level: LogLevel,
}

/// JSON envelope wrapping a typed [`Request`].
///
/// Serializes to `{"id": ..., "type": ..., "args": {...}, "settings": {...}}`.
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    pub id: &'a str,
    #[serde(flatten)]
    pub request: &'a Request,
    pub settings: RequestSettings,
}

/// Error details reported by the device when an operation fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceErrorBody {
    #[serde(default)]
    pub message: String,
}

/// JSON envelope of a device response.
///
/// Operation-specific result fields are kept in `fields` and decoded on demand
/// by [`DeviceResponse::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeviceErrorBody>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResponseEnvelope {
    /// Builds a successful envelope with the given result fields.
    pub fn ok(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            success: Some(true),
            error: None,
            fields,
        }
    }

    /// Builds a failed envelope carrying a device error message.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: Some(false),
            error: Some(DeviceErrorBody {
                message: message.into(),
            }),
            fields: Map::new(),
        }
    }

    /// Whether the device reported success.
    ///
    /// An envelope without an explicit `success` flag counts as successful
    /// unless it carries an `error` object.
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(self.error.is_none())
    }

    /// The device-supplied error message, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// A decoded response frame: the JSON envelope plus the raw binary segment.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub envelope: ResponseEnvelope,
    /// Raw binary segment. Empty (never absent) when the frame carried none.
    pub binary_payload: Vec<u8>,
}

impl DeviceResponse {
    /// Interprets a decoded [`Frame`] as a response envelope.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let envelope: ResponseEnvelope = serde_json::from_value(frame.json)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        Ok(Self {
            envelope,
            binary_payload: frame.binary_payload,
        })
    }

    /// The request id this response answers.
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    /// Decodes the operation-specific result fields into `T`.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.envelope.fields.clone()))
    }

    /// Returns a single result field, if present.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.envelope.fields.get(name)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Combine the 8-byte header, the JSON string and the binary segment into one
/// buffer so the frame goes out in a single write.
pub fn encode_frame(json: &str, binary: &[u8]) -> Vec<u8> {
    let string_bytes = json.as_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + string_bytes.len() + binary.len());
    frame.extend_from_slice(&(string_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(binary.len() as u32).to_le_bytes());
    frame.extend_from_slice(string_bytes);
    frame.extend_from_slice(binary);
    frame
}

/// Read `(string_len, binary_len)` from an 8-byte header.
pub fn read_frame_header(header: &[u8; HEADER_LEN]) -> (u32, u32) {
    let string_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let binary_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (string_len, binary_len)
}

fn check_segment(len: usize) -> Result<(), ProtocolError> {
    if len > u32::MAX as usize {
        return Err(ProtocolError::SegmentTooLarge(len));
    }
    Ok(())
}

/// Encode a typed request into a ready-to-write frame.
///
/// A binary payload carried by the request is kept out of the JSON `args` and
/// appended as the frame's binary segment.
pub fn encode_request(
    id: &str,
    request: &Request,
    settings: RequestSettings,
) -> Result<Vec<u8>, ProtocolError> {
    let envelope = RequestEnvelope {
        id,
        request,
        settings,
    };
    let json =
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    let binary = request.binary_payload().unwrap_or(&[]);
    check_segment(json.len())?;
    check_segment(binary.len())?;
    Ok(encode_frame(&json, binary))
}

/// Encode a response envelope into a frame. Used by device stand-ins.
pub fn encode_response(
    envelope: &ResponseEnvelope,
    binary: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let json =
        serde_json::to_string(envelope).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    check_segment(json.len())?;
    check_segment(binary.len())?;
    Ok(encode_frame(&json, binary))
}

// ---------------------------------------------------------------------------
// Streaming decoder
// ---------------------------------------------------------------------------

/// A complete frame yielded by [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub json: Value,
    pub binary_payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingString { string_len: usize, binary_len: usize },
    AwaitingBinary { binary_len: usize },
}

/// Segment lengths come from the peer; buffers beyond this grow as bytes arrive.
const MAX_UP_FRONT_RESERVE: usize = 64 * 1024;

/// Incremental frame decoder.
///
/// Bytes are fed in whatever chunks the socket delivers. A partially received
/// frame is buffered across calls without re-reading its header, and a chunk
/// holding the tail of one frame and the start of the next is split at the
/// boundary.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    string_payload: Vec<u8>,
    binary_payload: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            header: [0u8; HEADER_LEN],
            header_filled: 0,
            string_payload: Vec::new(),
            binary_payload: Vec::new(),
        }
    }

    /// Returns `true` when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingHeader && self.header_filled == 0
    }

    /// Feed one chunk and collect every frame it completes.
    ///
    /// A frame whose JSON segment fails to parse is reported as an error in
    /// place; the decoder stays aligned on the next frame boundary.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<Result<Frame, ProtocolError>> {
        let mut frames = Vec::new();

        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let take = (HEADER_LEN - self.header_filled).min(chunk.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_filled += take;
                    chunk = &chunk[take..];
                    if self.header_filled < HEADER_LEN {
                        break;
                    }

                    let (string_len, binary_len) = read_frame_header(&self.header);
                    self.header_filled = 0;
                    self.string_payload
                        .reserve((string_len as usize).min(MAX_UP_FRONT_RESERVE));
                    self.state = DecodeState::AwaitingString {
                        string_len: string_len as usize,
                        binary_len: binary_len as usize,
                    };
                }
                DecodeState::AwaitingString {
                    string_len,
                    binary_len,
                } => {
                    chunk = fill(&mut self.string_payload, string_len, chunk);
                    if self.string_payload.len() < string_len {
                        break;
                    }
                    self.binary_payload
                        .reserve(binary_len.min(MAX_UP_FRONT_RESERVE));
                    self.state = DecodeState::AwaitingBinary { binary_len };
                }
                DecodeState::AwaitingBinary { binary_len } => {
                    chunk = fill(&mut self.binary_payload, binary_len, chunk);
                    if self.binary_payload.len() < binary_len {
                        break;
                    }
                    frames.push(self.complete());
                    self.state = DecodeState::AwaitingHeader;
                }
            }
        }

        frames
    }

    fn complete(&mut self) -> Result<Frame, ProtocolError> {
        let string_payload = std::mem::take(&mut self.string_payload);
        let binary_payload = std::mem::take(&mut self.binary_payload);
        let json = serde_json::from_slice(&string_payload)
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        Ok(Frame {
            json,
            binary_payload,
        })
    }
}

/// Move bytes from `chunk` into `buf` until it holds `target` bytes; returns
/// the unconsumed remainder.
fn fill<'a>(buf: &mut Vec<u8>, target: usize, chunk: &'a [u8]) -> &'a [u8] {
    let take = target.saturating_sub(buf.len()).min(chunk.len());
    buf.extend_from_slice(&chunk[..take]);
    &chunk[take..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
